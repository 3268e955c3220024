//! The market-data distributor (C5).
//!
//! Single source of truth for minute bars: one canonical bar per symbol per
//! wall-clock minute, persisted and fanned out to every registered simulator
//! pod. Also serves the back-fill stream simulators use for gap replay.

pub mod generator;
pub mod registry;
pub mod service;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    distributor::{generator::BarGenerator, registry::Registry},
    error::SimdeskResult,
    storage::DatabaseGateway,
};

/// Next `:00` boundary strictly after `now`.
pub fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(now);
    truncated + TimeDelta::minutes(1)
}

/// The per-minute generation loop.
///
/// On each boundary: generate one bar per symbol, persist the batch, then
/// fan out to every registered downstream concurrently. A failed downstream
/// is logged and retried next minute; it is never dropped automatically.
pub struct Distributor {
    generator: Mutex<BarGenerator>,
    registry: Arc<Registry>,
    gateway: Arc<dyn DatabaseGateway>,
}

impl Distributor {
    pub fn new(
        generator: BarGenerator,
        registry: Arc<Registry>,
        gateway: Arc<dyn DatabaseGateway>,
    ) -> Self {
        Self {
            generator: Mutex::new(generator),
            registry,
            gateway,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("market-data distributor loop started");
        loop {
            let boundary = next_minute(Utc::now());
            let wait = (boundary - Utc::now())
                .to_std()
                .unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("distributor shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(err) = self.tick(boundary).await {
                error!(error = %err, "distribution tick failed");
            }
        }
    }

    /// One generation + persistence + fan-out cycle for the given boundary.
    pub async fn tick(&self, boundary: DateTime<Utc>) -> SimdeskResult<()> {
        let bars = self.generator.lock().await.generate(boundary);
        self.gateway.persist_bars(&bars).await?;
        self.registry.broadcast(&bars).await;
        Ok(())
    }
}
