//! Market-data distributor process (C5).

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use simdesk::{
    config::DistributorConfig,
    distributor::{
        Distributor,
        generator::BarGenerator,
        registry::{GrpcFeedPusher, Registry},
        service::{BackfillService, RegistrationApi, router},
    },
    generated::simdesk::v1::market_data_distributor_server::MarketDataDistributorServer,
    storage::{DatabaseGateway, memory::MemoryGateway},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    simdesk::telemetry::init_tracing("info");

    let cfg = DistributorConfig::from_env()?;
    info!(
        rest_port = cfg.rest_port,
        grpc_port = cfg.grpc_port,
        symbols = cfg.symbols.len(),
        "distributor starting"
    );

    let gateway: Arc<dyn DatabaseGateway> = Arc::new(MemoryGateway::new());
    let registry = Arc::new(Registry::new(Arc::new(GrpcFeedPusher)));
    let generator = BarGenerator::new(&cfg.symbols, cfg.rng_seed, cfg.sigma_redraw_probability);
    let distributor = Arc::new(Distributor::new(generator, registry.clone(), gateway.clone()));

    let shutdown = CancellationToken::new();
    let loop_shutdown = shutdown.clone();
    tokio::spawn(distributor.run(loop_shutdown));

    let grpc_addr = format!("0.0.0.0:{}", cfg.grpc_port).parse()?;
    let grpc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(MarketDataDistributorServer::new(BackfillService::new(
                gateway,
            )))
            .serve_with_shutdown(grpc_addr, grpc_shutdown.cancelled())
            .await;
    });
    info!(%grpc_addr, "backfill gRPC server listening");

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.rest_port)).await?;
    info!(addr = %listener.local_addr()?, "registration REST server listening");
    axum::serve(listener, router(RegistrationApi { registry })).await?;
    shutdown.cancel();
    Ok(())
}
