use axum::{Json, extract::State, http::HeaderMap};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::{
    breaker::BreakerError,
    domain::UserId,
    error::ErrorCategory,
    gateway::{
        ApiError, ApiResult, GatewayState,
        auth::authenticate,
        locks::UserLock,
        orders::{check_device, enforce_batch_cap, rate_check},
        routing::resolve_simulator,
    },
    generated::simdesk::v1 as pb,
    storage::{DatabaseGateway as _, IdempotencyKind},
};

/// Encoded research notes are capped at 64 KiB after decoding.
const MAX_NOTE_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct ConvictionBatchRequest {
    pub convictions: Vec<ConvictionItem>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvictionItem {
    #[serde(rename = "convictionId")]
    pub conviction_id: Option<String>,
    pub symbol: String,
    #[serde(rename = "targetWeight")]
    pub target_weight: Option<f64>,
    #[serde(rename = "targetNotional")]
    pub target_notional: Option<f64>,
    pub score: Option<f64>,
    pub urgency: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    /// Optional base64-encoded research note; validated and discarded.
    #[serde(rename = "researchNote")]
    pub research_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvictionItemResult {
    #[serde(rename = "convictionId")]
    pub conviction_id: String,
    pub success: bool,
    #[serde(rename = "orderIds", default)]
    pub order_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConvictionCancelRequest {
    #[serde(rename = "convictionIds")]
    pub conviction_ids: Vec<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

/// POST /api/convictions/submit
///
/// Convictions have their own idempotency namespace; replaying an order
/// request id as a conviction is a miss by construction.
pub async fn submit_batch(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<ConvictionBatchRequest>,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    enforce_batch_cap(&state, body.convictions.len())?;
    check_device(&state, &user_id, body.device_id.as_deref()).await?;

    let mut items = Vec::with_capacity(body.convictions.len());
    let mut precomputed: Vec<Option<ConvictionItemResult>> =
        Vec::with_capacity(body.convictions.len());
    for (index, item) in body.convictions.iter().enumerate() {
        let conviction_id = item
            .conviction_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(note) = &item.research_note
            && let Err(message) = validate_note(note)
        {
            precomputed.push(Some(ConvictionItemResult {
                conviction_id,
                success: false,
                order_ids: Vec::new(),
                error: Some(message),
            }));
            items.push(None);
            continue;
        }

        if let Some(request_id) = &item.request_id
            && let Ok(Some(cached)) = state
                .storage
                .idempotency_get(&user_id, IdempotencyKind::Conviction, request_id)
                .await
            && let Ok(result) = serde_json::from_str::<ConvictionItemResult>(&cached)
        {
            precomputed.push(Some(result));
            items.push(None);
            continue;
        }

        precomputed.push(None);
        items.push(Some((
            index,
            pb::ConvictionItem {
                conviction_id,
                symbol: item.symbol.clone(),
                target_weight: item.target_weight.unwrap_or_default(),
                target_notional: item.target_notional.unwrap_or_default(),
                score: item.score.unwrap_or_default(),
                urgency: item.urgency.clone().unwrap_or_default(),
            },
        )));
    }

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

    let to_forward: Vec<pb::ConvictionItem> = items
        .iter()
        .flatten()
        .map(|(_, item)| item.clone())
        .collect();
    let mut forwarded = Vec::new();
    let mut decision_log = Vec::new();
    if !to_forward.is_empty() {
        let request = pb::SubmitConvictionRequest {
            session_id: simulator.session_id.to_string(),
            convictions: to_forward,
        };
        match state
            .exchange_breaker
            .call(state.simulators.submit_convictions(&simulator.endpoint, request))
            .await
        {
            Ok(response) => {
                forwarded = response.results;
                decision_log = response.decision_log;
            }
            Err(BreakerError::Open(name)) => {
                lock.release().await;
                return Err(ApiError::new(
                    ErrorCategory::Unavailable,
                    format!("exchange unavailable (circuit '{name}' open)"),
                ));
            }
            Err(BreakerError::Inner(err)) => {
                lock.release().await;
                return Err(err.into());
            }
        }
    }
    lock.release().await;

    // Merge forwarded results back into input positions.
    let mut results: Vec<ConvictionItemResult> = Vec::with_capacity(body.convictions.len());
    let mut forwarded_iter = forwarded.into_iter();
    for (index, precomputed_result) in precomputed.into_iter().enumerate() {
        if let Some(result) = precomputed_result {
            results.push(result);
            continue;
        }
        let Some(raw) = forwarded_iter.next() else {
            results.push(ConvictionItemResult {
                conviction_id: String::new(),
                success: false,
                order_ids: Vec::new(),
                error: Some("simulator returned no result for this item".to_string()),
            });
            continue;
        };
        let result = ConvictionItemResult {
            conviction_id: raw.conviction_id.clone(),
            success: raw.success,
            order_ids: raw.order_ids,
            error: (!raw.error_message.is_empty()).then_some(raw.error_message),
        };

        // Remember the generated orders so a later cancel can unwind them,
        // and honor per-item idempotency.
        if result.success {
            if let Ok(encoded) = serde_json::to_string(&result.order_ids) {
                let _ = state
                    .storage
                    .idempotency_put(
                        &user_id,
                        IdempotencyKind::Conviction,
                        &format!("orders:{}", result.conviction_id),
                        &encoded,
                        state.cfg.idempotency_ttl,
                    )
                    .await;
            }
            if let Some(request_id) = body.convictions[index].request_id.as_ref()
                && let Ok(encoded) = serde_json::to_string(&result)
                && let Err(err) = state
                    .storage
                    .idempotency_put(
                        &user_id,
                        IdempotencyKind::Conviction,
                        request_id,
                        &encoded,
                        state.cfg.idempotency_ttl,
                    )
                    .await
            {
                warn!(error = %err, "conviction idempotency write failed");
            }
        }
        results.push(result);
    }

    Ok(Json(json!({
        "success": true,
        "results": results,
        "decisionLog": decision_log,
    })))
}

/// POST /api/convictions/cancel
///
/// Cancels the orders that a previously-submitted conviction generated.
pub async fn cancel_batch(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<ConvictionCancelRequest>,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    enforce_batch_cap(&state, body.conviction_ids.len())?;
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

    let mut results = Vec::with_capacity(body.conviction_ids.len());
    for conviction_id in &body.conviction_ids {
        results.push(cancel_one(&state, &user_id, &simulator, conviction_id).await);
    }
    lock.release().await;

    Ok(Json(json!({ "success": true, "results": results })))
}

async fn cancel_one(
    state: &GatewayState,
    user_id: &UserId,
    simulator: &crate::domain::simulator::Simulator,
    conviction_id: &str,
) -> ConvictionItemResult {
    let order_ids: Vec<String> = match state
        .storage
        .idempotency_get(
            user_id,
            IdempotencyKind::Conviction,
            &format!("orders:{conviction_id}"),
        )
        .await
    {
        Ok(Some(encoded)) => serde_json::from_str(&encoded).unwrap_or_default(),
        _ => {
            return ConvictionItemResult {
                conviction_id: conviction_id.to_string(),
                success: false,
                order_ids: Vec::new(),
                error: Some("unknown conviction id".to_string()),
            };
        }
    };

    let mut canceled = Vec::new();
    for order_id in &order_ids {
        let request = pb::CancelOrderRequest {
            session_id: simulator.session_id.to_string(),
            order_id: order_id.clone(),
        };
        match state
            .exchange_breaker
            .call(state.simulators.cancel_order(&simulator.endpoint, request))
            .await
        {
            Ok(response) if response.success => canceled.push(order_id.clone()),
            Ok(response) => {
                return ConvictionItemResult {
                    conviction_id: conviction_id.to_string(),
                    success: false,
                    order_ids: canceled,
                    error: Some(response.error_message),
                };
            }
            Err(err) => {
                let message = match err {
                    BreakerError::Open(name) => {
                        format!("exchange unavailable (circuit '{name}' open)")
                    }
                    BreakerError::Inner(inner) => inner.to_string(),
                };
                return ConvictionItemResult {
                    conviction_id: conviction_id.to_string(),
                    success: false,
                    order_ids: canceled,
                    error: Some(message),
                };
            }
        }
    }

    ConvictionItemResult {
        conviction_id: conviction_id.to_string(),
        success: true,
        order_ids: canceled,
        error: None,
    }
}

fn validate_note(note: &str) -> Result<(), String> {
    let decoded = BASE64
        .decode(note)
        .map_err(|_| "researchNote is not valid base64".to_string())?;
    if decoded.len() > MAX_NOTE_BYTES {
        return Err(format!(
            "researchNote exceeds {MAX_NOTE_BYTES} bytes after decoding"
        ));
    }
    Ok(())
}
