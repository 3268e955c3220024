//! The session router / fund-ops gateway (C4).
//!
//! Stateless REST front door: authenticates, validates, resolves the caller's
//! simulator and forwards order/conviction batches over gRPC. Durable state
//! (idempotency, per-user locks) lives in the storage and coordination
//! stores, never in the process.

pub mod auth;
pub mod convictions;
pub mod locks;
pub mod orders;
pub mod rate_limit;
pub mod records;
pub mod routing;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    breaker::CircuitBreaker,
    config::GatewayConfig,
    error::{ErrorCategory, SimdeskError},
    external::{AuthClient, EmailGateway},
    gateway::{rate_limit::RateLimiter, routing::SimulatorRouter},
    storage::{CoordinationStore, DatabaseGateway},
};

/// Shared state of the gateway process.
#[derive(Clone)]
pub struct GatewayState {
    pub cfg: Arc<GatewayConfig>,
    pub auth: Arc<dyn AuthClient>,
    pub storage: Arc<dyn DatabaseGateway>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub simulators: Arc<dyn SimulatorRouter>,
    pub email: Arc<dyn EmailGateway>,
    pub limiter: Arc<RateLimiter>,
    pub auth_breaker: Arc<CircuitBreaker>,
    pub exchange_breaker: Arc<CircuitBreaker>,
}

impl GatewayState {
    pub fn new(
        cfg: GatewayConfig,
        auth: Arc<dyn AuthClient>,
        storage: Arc<dyn DatabaseGateway>,
        coordination: Arc<dyn CoordinationStore>,
        simulators: Arc<dyn SimulatorRouter>,
        email: Arc<dyn EmailGateway>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            cfg.default_rate_per_minute,
            cfg.login_rate_per_minute,
        ));
        Self {
            cfg: Arc::new(cfg),
            auth,
            storage,
            coordination,
            simulators,
            email,
            limiter,
            auth_breaker: Arc::new(CircuitBreaker::with_defaults("auth")),
            exchange_breaker: Arc::new(CircuitBreaker::with_defaults("exchange")),
        }
    }
}

/// The full REST surface. Health probes bypass auth and rate limiting.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/orders/submit", post(orders::submit_batch))
        .route("/api/orders/cancel", post(orders::cancel_batch))
        .route("/api/convictions/submit", post(convictions::submit_batch))
        .route("/api/convictions/cancel", post(convictions::cancel_batch))
        .route("/api/funds", post(records::upsert_fund).get(records::get_fund))
        .route("/api/funds/{id}", get(records::get_fund_by_id).put(records::upsert_fund_by_id))
        .route("/api/books", post(records::upsert_book).get(records::list_books))
        .route("/api/books/{id}", get(records::get_book_by_id).put(records::upsert_book_by_id))
        .route("/api/feedback", post(records::submit_feedback))
        .route("/health", get(health))
        .route("/readiness", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "UP" }))
}

/// REST error envelope: `{success:false, error, errorCode, category}` plus
/// the HTTP status derived from the category.
#[derive(Debug)]
pub struct ApiError {
    pub category: ErrorCategory,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            category: ErrorCategory::Validation,
            message: format!("rate limit exceeded, retry in {retry_after_secs}s"),
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

impl From<SimdeskError> for ApiError {
    fn from(err: SimdeskError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.retry_after_secs.is_some() {
            StatusCode::TOO_MANY_REQUESTS
        } else {
            StatusCode::from_u16(self.category.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        };
        let mut body = json!({
            "success": false,
            "error": self.message,
            "errorCode": self.category.to_string(),
            "category": self.category.to_string(),
        });
        if let Some(retry) = self.retry_after_secs {
            body["retryAfterSeconds"] = json!(retry);
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
