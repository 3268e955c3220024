use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failure threshold breached, calls are rejected without being attempted.
    Open,
    /// Reset timeout elapsed; a single probe call is admitted.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Guards calls to a downstream service against cascading failures.
///
/// Three consecutive failures open the circuit; after `reset_timeout` a
/// single probe is admitted, and its outcome decides between closing and
/// re-opening.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Breaker with the platform defaults: 3 consecutive failures, 30 s reset.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, 3, Duration::from_secs(30))
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Runs `f` under breaker protection.
    ///
    /// When the circuit is open (and the reset timeout has not elapsed) the
    /// call is rejected without being attempted. In half-open state only one
    /// probe is admitted at a time; concurrent callers are rejected.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut guard = self.state.lock().await;
            match guard.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let elapsed = guard.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                    if elapsed >= self.reset_timeout {
                        info!(breaker = %self.name, "transitioning open -> half-open");
                        guard.state = CircuitState::HalfOpen;
                        guard.probe_in_flight = true;
                    } else {
                        return Err(BreakerError::Open(self.name.clone()));
                    }
                }
                CircuitState::HalfOpen => {
                    if guard.probe_in_flight {
                        return Err(BreakerError::Open(self.name.clone()));
                    }
                    guard.probe_in_flight = true;
                }
            }
        }

        match f.await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(BreakerError::Inner(err))
            }
        }
    }

    async fn on_success(&self) {
        let mut guard = self.state.lock().await;
        if guard.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "probe succeeded, closing circuit");
        }
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
        guard.probe_in_flight = false;
    }

    async fn on_failure(&self) {
        let mut guard = self.state.lock().await;
        guard.probe_in_flight = false;
        match guard.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, re-opening circuit");
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
            }
            _ => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = guard.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(async { Err::<(), _>("boom") })
            .await;
    }

    #[tokio::test]
    async fn opens_after_three_consecutive_failures() {
        let breaker = CircuitBreaker::with_defaults("auth");
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Open circuit rejects without calling through.
        let result = breaker.call(async { Ok::<_, &str>(1) }).await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::with_defaults("session");
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.call(async { Ok::<_, &str>(()) }).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new("exchange", 1, Duration::ZERO);
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Reset timeout of zero admits the probe immediately.
        breaker.call(async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new("container", 1, Duration::ZERO);
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }
}
