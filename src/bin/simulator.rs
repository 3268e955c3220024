//! Exchange-simulator process (C1): one per active session.

use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

use simdesk::{
    config::EngineConfig,
    domain::{SessionId, UserId, simulator::Simulator},
    engine::{
        EngineCoordinator, EngineState,
        coordinator::{BackfillSource, GrpcBackfill, NoBackfill},
        service::{MarketDataFeedService, SimulatorService},
        watchdog::{TtlWatchdog, WatchdogVerdict},
    },
    generated::simdesk::v1::{
        exchange_simulator_server::ExchangeSimulatorServer,
        market_data_feed_server::MarketDataFeedServer,
    },
    storage::{DatabaseGateway, memory::MemoryGateway},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    simdesk::telemetry::init_tracing("info");

    let cfg = EngineConfig::from_env()?;
    let session_id = SessionId::from(
        env::var("SESSION_ID")
            .unwrap_or_else(|_| "local-session".to_string())
            .as_str(),
    );
    let user_id = UserId::from(
        env::var("USER_ID")
            .unwrap_or_else(|_| "local-user".to_string())
            .as_str(),
    );
    info!(session_id = %session_id, user_id = %user_id, port = cfg.grpc_port, "simulator starting");

    // External persistence sits behind the gateway contract; this process
    // ships with the in-memory implementation.
    let gateway: Arc<dyn DatabaseGateway> = Arc::new(MemoryGateway::new());

    let simulator = Simulator::new(session_id.clone(), user_id.clone(), endpoint(&cfg), chrono::Utc::now());
    gateway.upsert_simulator(&simulator).await?;

    let backfill: Arc<dyn BackfillSource> = match env::var("DISTRIBUTOR_GRPC_ENDPOINT") {
        Ok(endpoint) => Arc::new(GrpcBackfill::new(endpoint)),
        Err(_) => {
            warn!("no distributor endpoint configured, gap replay will drain without backfill");
            Arc::new(NoBackfill)
        }
    };

    let shutdown = CancellationToken::new();
    let handle = EngineCoordinator::spawn(
        EngineState::new(session_id.clone(), user_id, cfg.clone()),
        gateway.clone(),
        backfill,
        shutdown.clone(),
    );

    let gateway_for_exit = gateway.clone();
    let watchdog = TtlWatchdog::new(
        handle.clone(),
        gateway,
        simulator.simulator_id.clone(),
        cfg.session_ttl,
        cfg.watchdog_period,
        shutdown.clone(),
    );
    let watchdog_task = tokio::spawn(watchdog.run());

    register_with_distributor(&cfg).await;

    let addr = format!("0.0.0.0:{}", cfg.grpc_port).parse()?;
    let service = SimulatorService::new(handle.clone(), shutdown.clone());
    let feed = MarketDataFeedService::new(handle);
    let server_shutdown = shutdown.clone();
    info!(%addr, "gRPC server listening");
    Server::builder()
        .add_service(ExchangeSimulatorServer::new(service))
        .add_service(MarketDataFeedServer::new(feed))
        .serve_with_shutdown(addr, server_shutdown.cancelled())
        .await?;

    match watchdog_task.await {
        Ok(Ok(WatchdogVerdict::TtlExpired)) => {
            error!("exiting non-zero after TTL self-termination");
            std::process::exit(1);
        }
        Ok(Ok(WatchdogVerdict::Shutdown)) => {}
        _ => {
            // Unexpected failure path: record ERROR so the control plane
            // recreates the pod instead of reattaching to it.
            let mut errored = simulator;
            errored.status = simdesk::domain::simulator::SimulatorStatus::Error;
            errored.termination_reason = Some("unexpected watchdog failure".to_string());
            let _ = gateway_for_exit.upsert_simulator(&errored).await;
            std::process::exit(1);
        }
    }
    Ok(())
}

fn endpoint(cfg: &EngineConfig) -> String {
    let host = env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
    format!("http://{host}:{}", cfg.grpc_port)
}

/// Announces this pod to the market-data distributor so bars start flowing.
async fn register_with_distributor(cfg: &EngineConfig) {
    let Ok(base) = env::var("DISTRIBUTOR_REST_ENDPOINT") else {
        warn!("no distributor REST endpoint configured, expecting bars to be pushed externally");
        return;
    };
    let host = env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
    let body = serde_json::json!({ "host": host, "port": cfg.grpc_port });

    match reqwest::Client::new()
        .post(format!("{base}/register"))
        .json(&body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!(distributor = %base, "registered for market data");
        }
        Ok(response) => {
            warn!(status = %response.status(), "distributor registration rejected");
        }
        Err(err) => {
            warn!(error = %err, "distributor registration failed");
        }
    }
}
