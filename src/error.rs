use thiserror::Error;

pub type SimdeskResult<T> = Result<T, SimdeskError>;

#[derive(Debug, Error)]
pub enum SimdeskError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Distributor(#[from] DistributorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse-grained error classes surfaced to clients.
///
/// Every leaf error maps to exactly one category; the category in turn
/// determines the HTTP status, the gRPC status code, and the `errorCode`
/// field of the REST error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorCategory {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }

    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            Self::Authentication => tonic::Code::Unauthenticated,
            Self::Authorization => tonic::Code::PermissionDenied,
            Self::Validation => tonic::Code::InvalidArgument,
            Self::NotFound => tonic::Code::NotFound,
            Self::Conflict => tonic::Code::Aborted,
            Self::Unavailable => tonic::Code::Unavailable,
            Self::Internal => tonic::Code::Internal,
        }
    }
}

/// Errors raised inside the simulator engine (C1).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown symbol: '{0}'")]
    UnknownSymbol(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Duplicate request id '{request_id}' with different payload")]
    IdempotencyConflict { request_id: String },

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: String, available: String },

    #[error("Invalid conviction: {0}")]
    InvalidConviction(String),

    #[error("Engine coordinator unavailable: {0}")]
    CoordinatorGone(String),

    #[error("Exchange stream already has a subscriber")]
    StreamBusy,

    #[error("Session TTL expired after {idle_secs}s without heartbeat")]
    TtlExpired { idle_secs: u64 },

    #[error("Order execution failed: {0}")]
    Execution(String),
}

/// Errors raised by the session core (C2).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Device mismatch: session is bound to another device")]
    DeviceMismatch,

    #[error("User {0} already has an active session")]
    AlreadyActive(String),

    #[error("Invalid session state for operation: {0}")]
    InvalidState(String),

    #[error("Simulator lost for session {0}")]
    SimulatorLost(String),

    #[error("Simulator start timed out after {0}s")]
    SimulatorStartTimeout(u64),

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),
}

/// Errors raised by the orchestrator control loop (C3).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown exchange: '{0}'")]
    UnknownExchange(String),

    #[error("Container API failure: {0}")]
    Container(String),

    #[error("Pod start exhausted {attempts} attempts: {last_error}")]
    StartExhausted { attempts: u32, last_error: String },

    #[error("Invalid exchange schedule: {0}")]
    InvalidSchedule(String),
}

/// Errors raised by the session router / fund-ops gateway (C4).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing or invalid authorization token")]
    Unauthenticated,

    #[error("Missing CSRF token")]
    MissingCsrf,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Batch of {got} items exceeds the cap of {cap}")]
    BatchTooLarge { got: usize, cap: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No active session for user {0}")]
    NoSession(String),

    #[error("Per-user lock busy")]
    LockBusy,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Downstream unavailable: {0}")]
    Downstream(String),
}

/// Errors raised by the market-data distributor (C5).
#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("Downstream '{0}' is unreachable")]
    Unreachable(String),

    #[error("Downstream '{0}' is not registered")]
    NotRegistered(String),

    #[error("Invalid backfill window: {0}")]
    InvalidWindow(String),
}

/// Errors from the database gateway and coordination store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Lock '{key}' is held by another owner")]
    LockHeld { key: String },

    #[error("Lock '{key}' release rejected: ownership token mismatch")]
    LockOwnership { key: String },

    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Errors from network transports (gRPC channels, HTTP clients).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("gRPC transport failure: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("gRPC call failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Invalid endpoint: '{0}'")]
    InvalidEndpoint(String),
}

/// Errors reading process configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {msg}")]
    InvalidValue { var: String, msg: String },
}

impl SimdeskError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Engine(e) => e.category(),
            Self::Session(e) => e.category(),
            Self::Orchestrator(_) => ErrorCategory::Unavailable,
            Self::Gateway(e) => e.category(),
            Self::Distributor(e) => e.category(),
            Self::Storage(e) => e.category(),
            Self::Transport(e) => e.category(),
            Self::Config(_) => ErrorCategory::Internal,
        }
    }
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownSymbol(_) | Self::InvalidOrder(_) | Self::InvalidConviction(_) => {
                ErrorCategory::Validation
            }
            Self::OrderNotFound(_) => ErrorCategory::NotFound,
            Self::IdempotencyConflict { .. } => ErrorCategory::Conflict,
            Self::InsufficientFunds { .. } => ErrorCategory::Validation,
            Self::CoordinatorGone(_) | Self::TtlExpired { .. } => ErrorCategory::Unavailable,
            Self::StreamBusy => ErrorCategory::Conflict,
            Self::Execution(_) => ErrorCategory::Internal,
        }
    }
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::DeviceMismatch | Self::AlreadyActive(_) => ErrorCategory::Authorization,
            Self::InvalidState(_) | Self::Protocol(_) => ErrorCategory::Validation,
            Self::SimulatorLost(_) | Self::SimulatorStartTimeout(_) => ErrorCategory::Unavailable,
        }
    }
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthenticated | Self::MissingCsrf => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::Validation,
            Self::BatchTooLarge { .. } | Self::InvalidPayload(_) => ErrorCategory::Validation,
            Self::NoSession(_) | Self::NotFound(_) => ErrorCategory::NotFound,
            Self::LockBusy | Self::Downstream(_) => ErrorCategory::Unavailable,
        }
    }
}

impl DistributorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unreachable(_) => ErrorCategory::Unavailable,
            Self::NotRegistered(_) => ErrorCategory::NotFound,
            Self::InvalidWindow(_) => ErrorCategory::Validation,
        }
    }
}

impl StorageError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Constraint(_) | Self::LockHeld { .. } | Self::LockOwnership { .. } => {
                ErrorCategory::Conflict
            }
            Self::Backend(_) => ErrorCategory::Unavailable,
        }
    }
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Grpc(_) | Self::Status(_) | Self::CircuitOpen { .. } => {
                ErrorCategory::Unavailable
            }
            Self::InvalidEndpoint(_) => ErrorCategory::Validation,
        }
    }
}

impl From<SimdeskError> for tonic::Status {
    fn from(err: SimdeskError) -> Self {
        tonic::Status::new(err.category().grpc_code(), err.to_string())
    }
}
