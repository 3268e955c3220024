use std::env;
use std::time::Duration;

use crate::error::{ConfigError, SimdeskResult};

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> SimdeskResult<T> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            ConfigError::InvalidValue {
                var: key.to_string(),
                msg: format!("could not parse '{raw}'"),
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}

fn var_string_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Database connection settings shared by every process.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        Ok(Self {
            host: var_string_or("DB_HOST", "localhost"),
            port: var_or("DB_PORT", 5432)?,
            name: var_string_or("DB_NAME", "simdesk"),
            user: var_string_or("DB_USER", "simdesk"),
            password: var_string_or("DB_PASSWORD", ""),
            min_connections: var_or("DB_MIN_CONNECTIONS", 1)?,
            max_connections: var_or("DB_MAX_CONNECTIONS", 10)?,
        })
    }
}

/// Observability toggles.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    pub metrics_port: u16,
}

impl TelemetryConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        Ok(Self {
            enable_tracing: var_bool("ENABLE_TRACING"),
            enable_metrics: var_bool("ENABLE_METRICS"),
            metrics_port: var_or("METRICS_PORT", 9090)?,
        })
    }
}

/// Settings for one simulator-engine process (C1).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub grpc_port: u16,
    pub session_ttl: Duration,
    pub watchdog_period: Duration,
    /// Tolerance around the expected 60 s bar cadence before a gap is declared.
    pub gap_tolerance_secs: i64,
    /// Gaps longer than this are skipped instead of replayed.
    pub max_replay_gap_secs: i64,
    pub impact_decay_rate: f64,
    pub impact_coefficient: f64,
    /// Full bid/ask spread applied around the last price for market fills.
    pub spread: f64,
    /// Fee charged on fills, in basis points of notional.
    pub fee_bps: f64,
    /// Fraction of a bar's volume available to fill resting orders.
    pub fill_participation: f64,
    pub initial_cash: f64,
    pub base_currency: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50060,
            session_ttl: Duration::from_secs(120),
            watchdog_period: Duration::from_secs(5),
            gap_tolerance_secs: 30,
            max_replay_gap_secs: 7_200,
            impact_decay_rate: 0.1,
            impact_coefficient: 0.01,
            spread: 0.02,
            fee_bps: 2.0,
            fill_participation: 0.25,
            initial_cash: 100_000.0,
            base_currency: "USD".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            grpc_port: var_or("GRPC_PORT", defaults.grpc_port)?,
            session_ttl: Duration::from_secs(var_or("SESSION_TTL_SECONDS", 120u64)?),
            watchdog_period: defaults.watchdog_period,
            gap_tolerance_secs: var_or("GAP_TOLERANCE_SECONDS", defaults.gap_tolerance_secs)?,
            max_replay_gap_secs: defaults.max_replay_gap_secs,
            impact_decay_rate: var_or("IMPACT_DECAY_RATE", defaults.impact_decay_rate)?,
            impact_coefficient: defaults.impact_coefficient,
            spread: var_or("SPREAD", defaults.spread)?,
            fee_bps: var_or("FEE_BPS", defaults.fee_bps)?,
            fill_participation: defaults.fill_participation,
            initial_cash: var_or("INITIAL_CASH", defaults.initial_cash)?,
            base_currency: var_string_or("BASE_CURRENCY", &defaults.base_currency),
        })
    }
}

/// Settings for the session-core process (C2).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rest_port: u16,
    pub pod_name: String,
    pub session_ttl: Duration,
    pub reconnect_timeout: Duration,
    /// How long `start_simulator` polls readiness before giving up.
    pub simulator_start_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rest_port: 8001,
            pod_name: "session-pod-local".to_string(),
            session_ttl: Duration::from_secs(120),
            reconnect_timeout: Duration::from_secs(30),
            simulator_start_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            rest_port: var_or("REST_PORT", defaults.rest_port)?,
            pod_name: var_string_or("POD_NAME", &defaults.pod_name),
            session_ttl: Duration::from_secs(var_or("SESSION_TTL_SECONDS", 120u64)?),
            reconnect_timeout: Duration::from_secs(var_or("RECONNECT_TIMEOUT", 30u64)?),
            simulator_start_timeout: defaults.simulator_start_timeout,
            heartbeat_interval: defaults.heartbeat_interval,
        })
    }
}

/// Settings for the orchestrator process (C3).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub max_start_attempts: u32,
    pub start_backoff: Duration,
    /// Probability that one control cycle also runs the orphan sweep.
    pub sweep_probability: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_start_attempts: 5,
            start_backoff: Duration::from_millis(500),
            sweep_probability: 0.2,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: Duration::from_secs(var_or("POLL_INTERVAL", 30u64)?),
            max_start_attempts: defaults.max_start_attempts,
            start_backoff: defaults.start_backoff,
            sweep_probability: defaults.sweep_probability,
        })
    }
}

/// Settings for the gateway process (C4).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rest_port: u16,
    pub batch_cap: usize,
    pub idempotency_ttl: Duration,
    pub lock_ttl: Duration,
    pub default_rate_per_minute: u32,
    pub login_rate_per_minute: u32,
    pub access_token_expiry: Duration,
    pub refresh_token_expiry: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rest_port: 8001,
            batch_cap: 100,
            idempotency_ttl: Duration::from_secs(24 * 3600),
            lock_ttl: Duration::from_secs(30),
            default_rate_per_minute: 30,
            login_rate_per_minute: 5,
            access_token_expiry: Duration::from_secs(3600),
            refresh_token_expiry: Duration::from_secs(2_592_000),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            rest_port: var_or("REST_PORT", defaults.rest_port)?,
            batch_cap: defaults.batch_cap,
            idempotency_ttl: defaults.idempotency_ttl,
            lock_ttl: defaults.lock_ttl,
            default_rate_per_minute: defaults.default_rate_per_minute,
            login_rate_per_minute: defaults.login_rate_per_minute,
            access_token_expiry: Duration::from_secs(var_or("ACCESS_TOKEN_EXPIRY", 3600u64)?),
            refresh_token_expiry: Duration::from_secs(var_or(
                "REFRESH_TOKEN_EXPIRY",
                2_592_000u64,
            )?),
        })
    }
}

/// Settings for the market-data distributor process (C5).
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub rest_port: u16,
    pub grpc_port: u16,
    pub symbols: Vec<String>,
    /// Probability per tick that a symbol's volatility is re-drawn.
    pub sigma_redraw_probability: f64,
    pub rng_seed: Option<u64>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            rest_port: 8002,
            grpc_port: 50070,
            symbols: ["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA", "NVDA", "JPM", "V"]
                .into_iter()
                .map(String::from)
                .collect(),
            sigma_redraw_probability: 0.05,
            rng_seed: None,
        }
    }
}

impl DistributorConfig {
    pub fn from_env() -> SimdeskResult<Self> {
        let defaults = Self::default();
        let symbols = match env::var("SYMBOLS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.symbols,
        };
        Ok(Self {
            rest_port: var_or("REST_PORT", defaults.rest_port)?,
            grpc_port: var_or("GRPC_PORT", defaults.grpc_port)?,
            symbols,
            sigma_redraw_probability: defaults.sigma_redraw_probability,
            rng_seed: match env::var("RNG_SEED") {
                Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidValue {
                    var: "RNG_SEED".to_string(),
                    msg: format!("could not parse '{raw}'"),
                })?),
                Err(_) => None,
            },
        })
    }
}
