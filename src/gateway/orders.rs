use axum::{Json, extract::State, http::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    breaker::BreakerError,
    domain::UserId,
    error::ErrorCategory,
    gateway::{
        ApiError, ApiResult, GatewayState,
        auth::authenticate,
        locks::UserLock,
        rate_limit::RouteClass,
        routing::resolve_simulator,
    },
    generated::simdesk::v1 as pb,
    storage::{DatabaseGateway as _, IdempotencyKind},
};

#[derive(Debug, Deserialize)]
pub struct OrderBatchRequest {
    pub orders: Vec<OrderItem>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderItem {
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub quantity: f64,
    pub price: Option<f64>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResult {
    pub success: bool,
    #[serde(rename = "orderId", skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    fn ok(order_id: String) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelBatchRequest {
    #[serde(rename = "orderIds")]
    pub order_ids: Vec<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

/// POST /api/orders/submit
///
/// Validates every item independently and forwards the valid ones to the
/// caller's simulator; the aggregate response preserves input order. Items
/// carrying a request id are idempotent for the configured TTL.
pub async fn submit_batch(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<OrderBatchRequest>,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    enforce_batch_cap(&state, body.orders.len())?;
    check_device(&state, &user_id, body.device_id.as_deref()).await?;

    let lock = UserLock::acquire(
        state.coordination.clone(),
        &user_id,
        state.cfg.lock_ttl,
    )
    .await?;

    let simulator = match resolve_simulator(&state, &user_id).await {
        Ok(simulator) => simulator,
        Err(err) => {
            lock.release().await;
            return Err(err.into());
        }
    };

    let mut results = Vec::with_capacity(body.orders.len());
    for item in &body.orders {
        results.push(submit_one(&state, &user_id, &simulator.endpoint, &simulator.session_id.0, item).await);
    }
    lock.release().await;

    info!(user_id = %user_id, count = results.len(), "order batch processed");
    Ok(Json(json!({ "success": true, "results": results })))
}

async fn submit_one(
    state: &GatewayState,
    user_id: &UserId,
    endpoint: &str,
    session_id: &str,
    item: &OrderItem,
) -> ItemResult {
    if let Err(message) = validate_item(item) {
        return ItemResult::fail(message);
    }

    if let Some(request_id) = &item.request_id {
        match state
            .storage
            .idempotency_get(user_id, IdempotencyKind::Order, request_id)
            .await
        {
            Ok(Some(cached)) => {
                if let Ok(result) = serde_json::from_str::<ItemResult>(&cached) {
                    return result;
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "idempotency lookup failed"),
        }
    }

    let request = pb::SubmitOrderRequest {
        session_id: session_id.to_string(),
        symbol: item.symbol.clone(),
        side: item.side.clone(),
        order_type: item.order_type.clone(),
        quantity: item.quantity,
        price: item.price.unwrap_or_default(),
        request_id: item.request_id.clone().unwrap_or_default(),
    };
    let response = state
        .exchange_breaker
        .call(state.simulators.submit_order(endpoint, request))
        .await;

    let result = match response {
        Ok(response) if response.success => ItemResult::ok(response.order_id),
        Ok(response) => ItemResult::fail(response.error_message),
        Err(BreakerError::Open(name)) => {
            ItemResult::fail(format!("exchange unavailable (circuit '{name}' open)"))
        }
        Err(BreakerError::Inner(err)) => ItemResult::fail(err.to_string()),
    };

    if result.success
        && let Some(request_id) = &item.request_id
        && let Ok(encoded) = serde_json::to_string(&result)
        && let Err(err) = state
            .storage
            .idempotency_put(
                user_id,
                IdempotencyKind::Order,
                request_id,
                &encoded,
                state.cfg.idempotency_ttl,
            )
            .await
    {
        warn!(error = %err, "idempotency store write failed");
    }
    result
}

/// POST /api/orders/cancel
pub async fn cancel_batch(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<CancelBatchRequest>,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    enforce_batch_cap(&state, body.order_ids.len())?;
    check_device(&state, &user_id, body.device_id.as_deref()).await?;

    let lock = UserLock::acquire(
        state.coordination.clone(),
        &user_id,
        state.cfg.lock_ttl,
    )
    .await?;
    let simulator = match resolve_simulator(&state, &user_id).await {
        Ok(simulator) => simulator,
        Err(err) => {
            lock.release().await;
            return Err(err.into());
        }
    };

    let mut results = Vec::with_capacity(body.order_ids.len());
    for order_id in &body.order_ids {
        let request = pb::CancelOrderRequest {
            session_id: simulator.session_id.to_string(),
            order_id: order_id.clone(),
        };
        let result = match state
            .exchange_breaker
            .call(state.simulators.cancel_order(&simulator.endpoint, request))
            .await
        {
            Ok(response) if response.success => ItemResult {
                success: true,
                order_id: Some(order_id.clone()),
                error: None,
            },
            Ok(response) => ItemResult::fail(response.error_message),
            Err(BreakerError::Open(name)) => {
                ItemResult::fail(format!("exchange unavailable (circuit '{name}' open)"))
            }
            Err(BreakerError::Inner(err)) => ItemResult::fail(err.to_string()),
        };
        results.push(result);
    }
    lock.release().await;

    Ok(Json(json!({ "success": true, "results": results })))
}

pub(super) fn rate_check(state: &GatewayState, user_id: &UserId) -> Result<(), ApiError> {
    state
        .limiter
        .check(RouteClass::Default, &user_id.0)
        .map_err(ApiError::rate_limited)
}

pub(super) fn enforce_batch_cap(state: &GatewayState, len: usize) -> Result<(), ApiError> {
    if len > state.cfg.batch_cap {
        return Err(ApiError::new(
            ErrorCategory::Validation,
            format!("batch of {len} items exceeds the cap of {}", state.cfg.batch_cap),
        ));
    }
    if len == 0 {
        return Err(ApiError::new(ErrorCategory::Validation, "empty batch"));
    }
    Ok(())
}

/// Orders must come from the device the session is bound to.
pub(super) async fn check_device(
    state: &GatewayState,
    user_id: &UserId,
    device_id: Option<&str>,
) -> Result<(), ApiError> {
    let Some(device_id) = device_id else {
        return Ok(());
    };
    let session = state
        .storage
        .session_for_user(user_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| {
            ApiError::new(ErrorCategory::NotFound, format!("no session for {user_id}"))
        })?;
    if session.device_id.0 != device_id {
        return Err(ApiError::new(
            ErrorCategory::Authorization,
            "device is not bound to the active session",
        ));
    }
    Ok(())
}

fn validate_item(item: &OrderItem) -> Result<(), String> {
    if item.symbol.is_empty() {
        return Err("symbol must not be empty".to_string());
    }
    if !matches!(item.side.as_str(), "BUY" | "SELL") {
        return Err(format!("unknown side '{}'", item.side));
    }
    if !matches!(item.order_type.as_str(), "MARKET" | "LIMIT") {
        return Err(format!("unknown order type '{}'", item.order_type));
    }
    if item.quantity <= 0.0 || !item.quantity.is_finite() {
        return Err(format!("quantity must be positive, got {}", item.quantity));
    }
    if item.order_type == "LIMIT" && item.price.map(|p| p <= 0.0).unwrap_or(true) {
        return Err("limit orders require a positive price".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn item() -> OrderItem {
        OrderItem {
            symbol: "AAPL".to_string(),
            side: "BUY".to_string(),
            order_type: "MARKET".to_string(),
            quantity: 10.0,
            price: None,
            request_id: Some("r1".to_string()),
        }
    }

    #[test]
    fn valid_item_passes() {
        assert!(validate_item(&item()).is_ok());
    }

    #[test]
    fn bad_side_and_quantity_fail() {
        let mut bad = item();
        bad.side = "HOLD".to_string();
        assert!(validate_item(&bad).is_err());

        let mut bad = item();
        bad.quantity = 0.0;
        assert!(validate_item(&bad).is_err());
    }

    #[test]
    fn limit_needs_price() {
        let mut limit = item();
        limit.order_type = "LIMIT".to_string();
        assert!(validate_item(&limit).is_err());
        limit.price = Some(101.5);
        assert!(validate_item(&limit).is_ok());
    }

    #[test]
    fn item_result_roundtrips_for_idempotency_cache() {
        let result = ItemResult::ok("o-1".to_string());
        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: ItemResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(result, decoded);
    }
}
