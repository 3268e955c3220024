use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    domain::SimulatorId,
    engine::coordinator::EngineHandle,
    error::SimdeskResult,
    storage::DatabaseGateway,
};

/// Why the watchdog returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// The session TTL lapsed; the process must exit non-zero.
    TtlExpired,
    /// External shutdown was requested.
    Shutdown,
}

/// TTL self-termination watchdog.
///
/// Checks the heartbeat clock every `period`; once the session has been
/// silent longer than `ttl` it writes the STOPPED record with a termination
/// reason and reports expiry. The caller stops serving and exits with a
/// non-zero status so the orchestrator does not restart the pod in place.
pub struct TtlWatchdog {
    handle: EngineHandle,
    gateway: Arc<dyn DatabaseGateway>,
    simulator_id: SimulatorId,
    ttl: Duration,
    period: Duration,
    shutdown: CancellationToken,
}

impl TtlWatchdog {
    pub fn new(
        handle: EngineHandle,
        gateway: Arc<dyn DatabaseGateway>,
        simulator_id: SimulatorId,
        ttl: Duration,
        period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            handle,
            gateway,
            simulator_id,
            ttl,
            period,
            shutdown,
        }
    }

    pub async fn run(self) -> SimdeskResult<WatchdogVerdict> {
        let ttl_ms = self.ttl.as_millis() as i64;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(WatchdogVerdict::Shutdown),
                _ = tokio::time::sleep(self.period) => {}
            }

            let idle_ms = self.handle.idle_ms();
            if idle_ms <= ttl_ms {
                continue;
            }

            let idle_secs = idle_ms / 1_000;
            warn!(
                simulator_id = %self.simulator_id,
                idle_secs,
                "session TTL expired, self-terminating"
            );
            let reason = format!(
                "session TTL expired: no heartbeat for {idle_secs}s (limit {}s)",
                self.ttl.as_secs()
            );
            self.gateway
                .mark_simulator_stopped(&self.simulator_id, &reason)
                .await?;

            info!(simulator_id = %self.simulator_id, "simulator record marked STOPPED");
            self.shutdown.cancel();
            return Ok(WatchdogVerdict::TtlExpired);
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        config::EngineConfig,
        domain::{SessionId, UserId, simulator::{Simulator, SimulatorStatus}},
        engine::{
            coordinator::{EngineCoordinator, NoBackfill},
            state::EngineState,
        },
        storage::memory::MemoryGateway,
    };

    fn engine(shutdown: CancellationToken) -> EngineHandle {
        let state = EngineState::new(
            SessionId::from("s1"),
            UserId::from("u1"),
            EngineConfig::default(),
        );
        EngineCoordinator::spawn(
            state,
            Arc::new(MemoryGateway::new()),
            Arc::new(NoBackfill),
            shutdown,
        )
    }

    #[tokio::test]
    async fn expiry_marks_record_and_cancels() {
        let shutdown = CancellationToken::new();
        let handle = engine(shutdown.clone());
        let gateway = Arc::new(MemoryGateway::new());
        let simulator = Simulator::new(
            SessionId::from("s1"),
            UserId::from("u1"),
            "http://127.0.0.1:50060",
            Utc::now(),
        );
        gateway.upsert_simulator(&simulator).await.unwrap();

        // TTL of zero expires on the first check.
        let watchdog = TtlWatchdog::new(
            handle,
            gateway.clone(),
            simulator.simulator_id.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
            shutdown.clone(),
        );
        let verdict = watchdog.run().await.unwrap();
        assert_eq!(verdict, WatchdogVerdict::TtlExpired);
        assert!(shutdown.is_cancelled());

        let stored = gateway
            .simulator(&simulator.simulator_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SimulatorStatus::Stopped);
        assert!(stored.termination_reason.unwrap().contains("TTL expired"));
    }

    #[tokio::test]
    async fn live_heartbeats_keep_it_quiet() {
        let shutdown = CancellationToken::new();
        let handle = engine(shutdown.clone());
        let gateway = Arc::new(MemoryGateway::new());
        let simulator = Simulator::new(
            SessionId::from("s1"),
            UserId::from("u1"),
            "http://127.0.0.1:50060",
            Utc::now(),
        );
        gateway.upsert_simulator(&simulator).await.unwrap();
        handle.heartbeat(Utc::now().timestamp_millis()).await.unwrap();

        let watchdog = TtlWatchdog::new(
            handle,
            gateway,
            simulator.simulator_id.clone(),
            Duration::from_secs(120),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        let run = tokio::spawn(watchdog.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());

        shutdown.cancel();
        assert_eq!(run.await.unwrap().unwrap(), WatchdogVerdict::Shutdown);
    }
}
