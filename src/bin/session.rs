//! Session-core process (C2): WebSocket termination and simulator proxying.

use std::env;
use std::sync::Arc;
use tracing::info;

use simdesk::{
    config::SessionConfig,
    external::{AuthClient, StaticAuthClient},
    orchestrator::container::InMemoryContainerApi,
    session::{
        SessionManager, SimulatorOps,
        simulator_ops::PodProvisioner,
        socket::{SessionServer, router},
        stream::{GrpcSimulatorLink, SimulatorLink},
    },
    storage::{DatabaseGateway, memory::MemoryGateway},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    simdesk::telemetry::init_tracing("info");

    let cfg = SessionConfig::from_env()?;
    info!(port = cfg.rest_port, pod = %cfg.pod_name, "session core starting");

    let storage: Arc<dyn DatabaseGateway> = Arc::new(MemoryGateway::new());
    let auth: Arc<dyn AuthClient> = Arc::new(auth_from_env());
    let link: Arc<dyn SimulatorLink> = Arc::new(GrpcSimulatorLink);

    // The session pod provisions its own per-session simulator pods through
    // the container API. The in-memory API stands in for the cluster here.
    let containers = Arc::new(InMemoryContainerApi::new());
    let provisioner = Arc::new(PodProvisioner::new(
        containers,
        env::var("SIMULATOR_IMAGE").unwrap_or_else(|_| "simdesk/simulator:latest".to_string()),
        50060,
    ));
    let ops = Arc::new(SimulatorOps::new(
        storage.clone(),
        provisioner,
        link.clone(),
        cfg.simulator_start_timeout,
    ));
    let manager = Arc::new(
        SessionManager::new(cfg.clone(), storage.clone()).with_simulator_ops(ops.clone()),
    );

    let app = router(SessionServer {
        auth,
        manager,
        ops,
        link,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.rest_port)).await?;
    info!(addr = %listener.local_addr()?, "websocket server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Static token table for the out-of-scope auth service:
/// `AUTH_TOKENS=token1:user1:role1,token2:user2:role2`.
fn auth_from_env() -> StaticAuthClient {
    let mut client = StaticAuthClient::new();
    if let Ok(raw) = env::var("AUTH_TOKENS") {
        for entry in raw.split(',') {
            let mut parts = entry.splitn(3, ':');
            if let (Some(token), Some(user)) = (parts.next(), parts.next()) {
                client = client.with_token(token, user, parts.next().unwrap_or("trader"));
            }
        }
    }
    client
}
