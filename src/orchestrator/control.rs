use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    config::OrchestratorConfig,
    error::{OrchestratorError, SimdeskError, SimdeskResult},
    orchestrator::{
        calendar,
        container::{ContainerApi, PodRef, PodSpec},
    },
    storage::{DatabaseGateway, ExchangeRecord},
};

const POD_LABEL: &str = "app=simdesk-simulator";

/// Schedule-driven pod lifecycle loop.
///
/// Each cycle reads the active exchanges, compares the desired run state
/// against the cached running set and converges the container API toward it.
/// No single pod may stall the loop: every failure is contained to its
/// exchange and retried on a later cycle.
pub struct ControlLoop {
    cfg: OrchestratorConfig,
    gateway: Arc<dyn DatabaseGateway>,
    containers: Arc<dyn ContainerApi>,
    container_breaker: CircuitBreaker,
    running: HashMap<String, PodRef>,
    cycle: u64,
}

impl ControlLoop {
    pub fn new(
        cfg: OrchestratorConfig,
        gateway: Arc<dyn DatabaseGateway>,
        containers: Arc<dyn ContainerApi>,
    ) -> Self {
        Self {
            cfg,
            gateway,
            containers,
            container_breaker: CircuitBreaker::with_defaults("container-api"),
            running: HashMap::new(),
            cycle: 0,
        }
    }

    async fn guarded_start(&self, spec: PodSpec) -> SimdeskResult<PodRef> {
        self.container_breaker
            .call(self.containers.start(spec))
            .await
            .map_err(|err| match err {
                BreakerError::Open(name) => SimdeskError::from(OrchestratorError::Container(
                    format!("circuit '{name}' open"),
                )),
                BreakerError::Inner(inner) => inner,
            })
    }

    async fn guarded_stop(&self, pod: &PodRef) -> SimdeskResult<()> {
        self.container_breaker
            .call(self.containers.stop(pod))
            .await
            .map_err(|err| match err {
                BreakerError::Open(name) => SimdeskError::from(OrchestratorError::Container(
                    format!("circuit '{name}' open"),
                )),
                BreakerError::Inner(inner) => inner,
            })
    }

    pub fn is_running(&self, exch_id: &str) -> bool {
        self.running.contains_key(exch_id)
    }

    pub fn pod_for(&self, exch_id: &str) -> Option<&PodRef> {
        self.running.get(exch_id)
    }

    /// Runs cycles until shutdown. Shutdown does NOT stop live simulators:
    /// they keep serving existing sessions until their own TTL fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(poll_interval = ?self.cfg.poll_interval, "orchestrator control loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("orchestrator shutting down, leaving pods to their TTL");
                    return;
                }
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
            }
            if let Err(err) = self.tick(Utc::now()).await {
                error!(error = %err, "control cycle failed");
            }
        }
    }

    /// One control cycle at the given wall-clock instant.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> SimdeskResult<()> {
        self.cycle += 1;
        let exchanges = self.gateway.active_exchanges().await?;

        for exchange in &exchanges {
            let should = match calendar::should_be_running(exchange, now) {
                Ok(should) => should,
                Err(err) => {
                    warn!(exch_id = %exchange.exch_id, error = %err, "skipping exchange with bad schedule");
                    continue;
                }
            };
            let is = self.running.contains_key(&exchange.exch_id);

            if should && !is {
                match self.start_with_backoff(exchange).await {
                    Ok(pod) => {
                        info!(exch_id = %exchange.exch_id, pod = %pod.name, "simulator pod started");
                        self.running.insert(exchange.exch_id.clone(), pod);
                    }
                    Err(err) => {
                        error!(exch_id = %exchange.exch_id, error = %err, "pod start exhausted retries");
                    }
                }
            } else if !should && is {
                let pod = self.running.get(&exchange.exch_id).cloned();
                if let Some(pod) = pod {
                    match self.guarded_stop(&pod).await {
                        Ok(()) => {
                            info!(exch_id = %exchange.exch_id, pod = %pod.name, "simulator pod stopped");
                            self.running.remove(&exchange.exch_id);
                        }
                        Err(err) => {
                            // Keep it in the running set so the next cycle retries.
                            warn!(exch_id = %exchange.exch_id, error = %err, "pod stop failed, will retry");
                        }
                    }
                }
            }
        }

        if rand::rng().random_bool(self.cfg.sweep_probability) {
            self.sweep(&exchanges).await?;
        }
        Ok(())
    }

    async fn start_with_backoff(&self, exchange: &ExchangeRecord) -> SimdeskResult<PodRef> {
        let mut backoff = self.cfg.start_backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.cfg.max_start_attempts {
            match self.guarded_start(pod_spec(exchange)).await {
                Ok(pod) => return Ok(pod),
                Err(err) => {
                    warn!(
                        exch_id = %exchange.exch_id,
                        attempt,
                        error = %err,
                        "pod start attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
            if attempt < self.cfg.max_start_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(OrchestratorError::StartExhausted {
            attempts: self.cfg.max_start_attempts,
            last_error,
        }
        .into())
    }

    /// Deletes live pods whose exchange no longer exists in the database.
    pub async fn sweep(&mut self, exchanges: &[ExchangeRecord]) -> SimdeskResult<()> {
        let known: HashSet<&str> = exchanges.iter().map(|e| e.exch_id.as_str()).collect();
        let live = self.containers.list(POD_LABEL).await?;

        for pod in live {
            // Session-scoped pods have their own TTL lifecycle.
            if pod.name.starts_with("sim-sess-") {
                continue;
            }
            let Some(exch_id) = pod.name.strip_prefix("sim-") else {
                continue;
            };
            if known.contains(exch_id) {
                continue;
            }
            warn!(pod = %pod.name, "orphan pod, deleting");
            if let Err(err) = self.containers.stop(&pod).await {
                warn!(pod = %pod.name, error = %err, "orphan delete failed");
            }
            self.running.retain(|_, running| running != &pod);
        }
        Ok(())
    }
}

fn pod_spec(exchange: &ExchangeRecord) -> PodSpec {
    PodSpec {
        name: format!("sim-{}", exchange.exch_id),
        image: "simdesk/simulator:latest".to_string(),
        labels: HashMap::from([
            ("app".to_string(), "simdesk-simulator".to_string()),
            ("exch".to_string(), exchange.exch_id.clone()),
        ]),
        env: vec![("EXCH_ID".to_string(), exchange.exch_id.clone())],
        grpc_port: 50060,
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveTime, TimeZone};
    use std::time::Duration;

    use super::*;
    use crate::{
        orchestrator::container::InMemoryContainerApi,
        storage::memory::MemoryGateway,
    };

    fn nyse() -> ExchangeRecord {
        ExchangeRecord {
            exch_id: "us_equity".to_string(),
            timezone: "America/New_York".to_string(),
            pre_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            post_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        }
    }

    async fn setup() -> (ControlLoop, Arc<InMemoryContainerApi>, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.seed_exchanges(vec![nyse()]).await;
        let containers = Arc::new(InMemoryContainerApi::new());
        let cfg = OrchestratorConfig {
            start_backoff: Duration::from_millis(1),
            sweep_probability: 0.0,
            ..OrchestratorConfig::default()
        };
        let control = ControlLoop::new(cfg, gateway.clone(), containers.clone());
        (control, containers, gateway)
    }

    fn ny_utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2026-03-02 is EST (UTC-5).
        Utc.with_ymd_and_hms(2026, 3, 2, h + 5, m, s).unwrap()
    }

    #[tokio::test]
    async fn opens_and_closes_with_the_calendar() {
        let (mut control, containers, _gateway) = setup().await;

        // Before pre-open: nothing.
        control.tick(ny_utc(9, 29, 50)).await.unwrap();
        assert!(!control.is_running("us_equity"));
        assert_eq!(containers.pod_count(), 0);

        // Just after open: pod up.
        control.tick(ny_utc(9, 30, 5)).await.unwrap();
        assert!(control.is_running("us_equity"));
        assert!(containers.has_pod("sim-us_equity"));

        // Mid-session ticks are stable.
        control.tick(ny_utc(12, 0, 0)).await.unwrap();
        assert_eq!(containers.pod_count(), 1);

        // Just after post-close: pod torn down within one cycle.
        control.tick(ny_utc(16, 0, 5)).await.unwrap();
        assert!(!control.is_running("us_equity"));
        assert_eq!(containers.pod_count(), 0);
    }

    #[tokio::test]
    async fn start_failures_are_retried_with_backoff() {
        let (mut control, containers, _gateway) = setup().await;
        containers.fail_next_starts(2);

        control.tick(ny_utc(10, 0, 0)).await.unwrap();
        // Two injected failures, third attempt inside the same cycle wins.
        assert!(control.is_running("us_equity"));
    }

    #[tokio::test]
    async fn exhausted_starts_trip_the_container_breaker() {
        let (mut control, containers, _gateway) = setup().await;
        containers.fail_next_starts(10);

        // Three real failures open the circuit; the remaining attempts are
        // rejected without reaching the container API.
        control.tick(ny_utc(10, 0, 0)).await.unwrap();
        assert!(!control.is_running("us_equity"));
        assert_eq!(containers.pod_count(), 0);

        // While the circuit is open the next cycle fails fast, leaving the
        // exchange down until the reset timeout admits a probe.
        control.tick(ny_utc(10, 1, 0)).await.unwrap();
        assert!(!control.is_running("us_equity"));
    }

    #[tokio::test]
    async fn sweep_deletes_orphans_only() {
        let (mut control, containers, _gateway) = setup().await;
        control.tick(ny_utc(10, 0, 0)).await.unwrap();

        // A pod for an exchange the DB no longer knows about.
        containers.inject_pod(PodSpec {
            name: "sim-ghost".to_string(),
            image: "simdesk/simulator:latest".to_string(),
            labels: HashMap::from([("app".to_string(), "simdesk-simulator".to_string())]),
            env: vec![],
            grpc_port: 50060,
        });
        assert_eq!(containers.pod_count(), 2);

        control.sweep(&[nyse()]).await.unwrap();
        assert_eq!(containers.pod_count(), 1);
        assert!(containers.has_pod("sim-us_equity"));
    }
}
