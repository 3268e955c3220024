//! Session router / fund-ops gateway process (C4).

use std::env;
use std::sync::Arc;
use tracing::info;

use simdesk::{
    config::GatewayConfig,
    external::{AuthClient, NoopEmailGateway, StaticAuthClient},
    gateway::{GatewayState, router, routing::GrpcSimulatorRouter},
    storage::memory::{MemoryCoordinationStore, MemoryGateway},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    simdesk::telemetry::init_tracing("info");

    let cfg = GatewayConfig::from_env()?;
    let port = cfg.rest_port;
    info!(port, "gateway starting");

    let auth: Arc<dyn AuthClient> = Arc::new(auth_from_env());
    let state = GatewayState::new(
        cfg,
        auth,
        Arc::new(MemoryGateway::new()),
        Arc::new(MemoryCoordinationStore::new()),
        Arc::new(GrpcSimulatorRouter),
        Arc::new(NoopEmailGateway),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "REST server listening");
    axum::serve(listener, router(state)).await?;
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
