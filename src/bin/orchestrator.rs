//! Orchestrator process (C3): schedule-driven simulator pod lifecycle.

use chrono::NaiveTime;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use simdesk::{
    config::OrchestratorConfig,
    orchestrator::{ControlLoop, container::InMemoryContainerApi},
    storage::{DatabaseGateway, ExchangeRecord, memory::MemoryGateway},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    simdesk::telemetry::init_tracing("info");

    let cfg = OrchestratorConfig::from_env()?;
    info!(poll = ?cfg.poll_interval, "orchestrator starting");

    let memory = Arc::new(MemoryGateway::new());
    // The exchange table is maintained by an external batch pipeline; seed
    // the US equity venue for standalone runs.
    memory
        .seed_exchanges(vec![ExchangeRecord {
            exch_id: "us_equity".to_string(),
            timezone: "America/New_York".to_string(),
            pre_open: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
            open: NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"),
            close: NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
            post_close: NaiveTime::from_hms_opt(16, 30, 0).expect("valid time"),
        }])
        .await;
    let gateway: Arc<dyn DatabaseGateway> = memory;
    let containers = Arc::new(InMemoryContainerApi::new());

    let shutdown = CancellationToken::new();
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_on_signal.cancel();
    });

    ControlLoop::new(cfg, gateway, containers).run(shutdown).await;
    Ok(())
}
