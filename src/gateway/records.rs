use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    error::ErrorCategory,
    external::EmailGateway as _,
    gateway::{ApiError, ApiResult, GatewayState, auth::authenticate, orders::rate_check},
    storage::{BookRecord, DatabaseGateway as _, FeedbackRecord, FundRecord},
};

#[derive(Debug, Deserialize)]
pub struct FundPayload {
    #[serde(rename = "fundId")]
    pub fund_id: Option<String>,
    pub name: String,
    #[serde(rename = "baseCurrency", default = "default_currency")]
    pub base_currency: String,
    #[serde(default)]
    pub aum: f64,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
pub struct BookPayload {
    #[serde(rename = "bookId")]
    pub book_id: Option<String>,
    #[serde(rename = "fundId")]
    pub fund_id: String,
    pub name: String,
    pub strategy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackPayload {
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub email_copy: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

/// POST /api/funds (and PUT /api/funds/{id})
pub async fn upsert_fund(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(payload): Json<FundPayload>,
) -> ApiResult<Json<Value>> {
    store_fund(&state, &headers, None, payload).await
}

pub async fn upsert_fund_by_id(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<FundPayload>,
) -> ApiResult<Json<Value>> {
    store_fund(&state, &headers, Some(id), payload).await
}

async fn store_fund(
    state: &GatewayState,
    headers: &HeaderMap,
    path_id: Option<String>,
    payload: FundPayload,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(state, headers).await?;
    rate_check(state, &user_id)?;
    if payload.name.is_empty() {
        return Err(ApiError::new(ErrorCategory::Validation, "fund name required"));
    }

    let fund = FundRecord {
        fund_id: path_id
            .or(payload.fund_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        user_id: user_id.clone(),
        name: payload.name,
        base_currency: payload.base_currency,
        aum: payload.aum,
        updated_at: Utc::now(),
    };
    state.storage.upsert_fund(&fund).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true, "fund": fund })))
}

/// GET /api/funds?id=… and GET /api/funds/{id}
pub async fn get_fund(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> ApiResult<Json<Value>> {
    let id = query
        .id
        .ok_or_else(|| ApiError::new(ErrorCategory::Validation, "missing fund id"))?;
    fetch_fund(&state, &headers, &id).await
}

pub async fn get_fund_by_id(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    fetch_fund(&state, &headers, &id).await
}

async fn fetch_fund(state: &GatewayState, headers: &HeaderMap, id: &str) -> ApiResult<Json<Value>> {
    let user_id = authenticate(state, headers).await?;
    rate_check(state, &user_id)?;
    let fund = state
        .storage
        .fund(id)
        .await
        .map_err(ApiError::from)?
        .filter(|fund| fund.user_id == user_id)
        .ok_or_else(|| ApiError::new(ErrorCategory::NotFound, format!("fund {id} not found")))?;
    Ok(Json(json!({ "success": true, "fund": fund })))
}

/// POST /api/books (and PUT /api/books/{id})
pub async fn upsert_book(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(payload): Json<BookPayload>,
) -> ApiResult<Json<Value>> {
    store_book(&state, &headers, None, payload).await
}

pub async fn upsert_book_by_id(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<BookPayload>,
) -> ApiResult<Json<Value>> {
    store_book(&state, &headers, Some(id), payload).await
}

async fn store_book(
    state: &GatewayState,
    headers: &HeaderMap,
    path_id: Option<String>,
    payload: BookPayload,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(state, headers).await?;
    rate_check(state, &user_id)?;
    if payload.name.is_empty() {
        return Err(ApiError::new(ErrorCategory::Validation, "book name required"));
    }
    // Books hang off an existing fund of the same user.
    let fund = state
        .storage
        .fund(&payload.fund_id)
        .await
        .map_err(ApiError::from)?
        .filter(|fund| fund.user_id == user_id)
        .ok_or_else(|| {
            ApiError::new(
                ErrorCategory::NotFound,
                format!("fund {} not found", payload.fund_id),
            )
        })?;

    let book = BookRecord {
        book_id: path_id
            .or(payload.book_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        user_id: user_id.clone(),
        fund_id: fund.fund_id,
        name: payload.name,
        strategy: payload.strategy,
        updated_at: Utc::now(),
    };
    state.storage.upsert_book(&book).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true, "book": book })))
}

/// GET /api/books — lists the caller's books.
pub async fn list_books(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    let mut books = state
        .storage
        .books_for_user(&user_id)
        .await
        .map_err(ApiError::from)?;
    books.sort_by(|a, b| a.book_id.cmp(&b.book_id));
    Ok(Json(json!({ "success": true, "books": books })))
}

pub async fn get_book_by_id(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    let book = state
        .storage
        .book(&id)
        .await
        .map_err(ApiError::from)?
        .filter(|book| book.user_id == user_id)
        .ok_or_else(|| ApiError::new(ErrorCategory::NotFound, format!("book {id} not found")))?;
    Ok(Json(json!({ "success": true, "book": book })))
}

/// POST /api/feedback
pub async fn submit_feedback(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(payload): Json<FeedbackPayload>,
) -> ApiResult<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    rate_check(&state, &user_id)?;
    if payload.message.is_empty() {
        return Err(ApiError::new(
            ErrorCategory::Validation,
            "feedback message required",
        ));
    }

    let feedback = FeedbackRecord {
        user_id: user_id.clone(),
        category: payload.category,
        message: payload.message,
        submitted_at: Utc::now(),
    };
    state
        .storage
        .record_feedback(&feedback)
        .await
        .map_err(ApiError::from)?;
    info!(user_id = %user_id, category = %feedback.category, "feedback recorded");

    if payload.email_copy {
        let delivered = state
            .email
            .send(
                &format!("{user_id}@users.simdesk.internal"),
                "We received your feedback",
                "feedback_receipt",
                &json!({ "category": feedback.category }),
            )
            .await;
        if !delivered {
            info!(user_id = %user_id, "feedback receipt email not delivered");
        }
    }
    Ok(Json(json!({ "success": true })))
}
