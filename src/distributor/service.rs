use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::{get, post}};
use chrono::DateTime;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::{
    distributor::registry::Registry,
    generated::simdesk::v1::{self as pb, market_data_distributor_server::MarketDataDistributor},
    storage::DatabaseGateway,
};

/// REST registration surface of the distributor.
#[derive(Clone)]
pub struct RegistrationApi {
    pub registry: Arc<Registry>,
}

pub fn router(api: RegistrationApi) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/unregister", post(unregister))
        .route("/health", get(health))
        .with_state(api)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "UP" }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    host: String,
    port: Option<u16>,
}

async fn register(
    State(api): State<RegistrationApi>,
    Json(body): Json<RegisterRequest>,
) -> impl IntoResponse {
    match api.registry.register(&body.host, body.port).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": err.to_string() })),
        ),
    }
}

async fn unregister(
    State(api): State<RegistrationApi>,
    Json(body): Json<RegisterRequest>,
) -> impl IntoResponse {
    match api.registry.unregister(&body.host).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": err.to_string() })),
        ),
    }
}

/// Serves historical bars to simulators replaying a gap, one batch per
/// minute, oldest first.
pub struct BackfillService {
    gateway: Arc<dyn DatabaseGateway>,
}

impl BackfillService {
    pub fn new(gateway: Arc<dyn DatabaseGateway>) -> Self {
        Self { gateway }
    }
}

#[tonic::async_trait]
impl MarketDataDistributor for BackfillService {
    type BackfillStream = ReceiverStream<Result<pb::MinuteBarBatch, Status>>;

    async fn backfill(
        &self,
        request: Request<pb::BackfillRequest>,
    ) -> Result<Response<Self::BackfillStream>, Status> {
        let req = request.into_inner();
        let start = DateTime::from_timestamp_millis(req.start_utc_ms)
            .ok_or_else(|| Status::invalid_argument("start timestamp out of range"))?;
        let end = DateTime::from_timestamp_millis(req.end_utc_ms)
            .ok_or_else(|| Status::invalid_argument("end timestamp out of range"))?;
        if end <= start {
            return Err(Status::invalid_argument("empty backfill window"));
        }

        let mut bars = self
            .gateway
            .bars_between(start, end)
            .await
            .map_err(Status::from)?;
        if !req.symbols.is_empty() {
            bars.retain(|bar| req.symbols.contains(&bar.symbol.0));
        }

        let grouped = bars.into_iter().chunk_by(|bar| bar.timestamp_utc);
        let batches: Vec<pb::MinuteBarBatch> = grouped
            .into_iter()
            .map(|(_, group)| pb::MinuteBarBatch {
                bars: group.map(|bar| pb::MarketDataBar::from(&bar)).collect(),
            })
            .collect();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for batch in batches {
                if tx.send(Ok(batch)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;

    use super::*;
    use crate::{
        domain::{Price, Quantity, Symbol, bar::MinuteBar},
        storage::memory::MemoryGateway,
    };

    fn bar(minute: u32, symbol: &str) -> MinuteBar {
        MinuteBar {
            symbol: Symbol::from(symbol),
            timestamp_utc: Utc.with_ymd_and_hms(2026, 3, 2, 14, minute, 0).unwrap(),
            open: Price(1.0),
            high: Price(1.0),
            low: Price(1.0),
            close: Price(1.0),
            volume: Quantity(1.0),
            vwap: Price(1.0),
        }
    }

    #[tokio::test]
    async fn backfill_streams_per_minute_batches_in_order() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway
            .persist_bars(&[bar(32, "AAPL"), bar(31, "AAPL"), bar(31, "MSFT")])
            .await
            .unwrap();

        let service = BackfillService::new(gateway);
        let response = service
            .backfill(Request::new(pb::BackfillRequest {
                start_utc_ms: Utc
                    .with_ymd_and_hms(2026, 3, 2, 14, 30, 0)
                    .unwrap()
                    .timestamp_millis(),
                end_utc_ms: Utc
                    .with_ymd_and_hms(2026, 3, 2, 14, 33, 0)
                    .unwrap()
                    .timestamp_millis(),
                symbols: vec![],
            }))
            .await
            .unwrap();

        let batches: Vec<_> = response.into_inner().collect().await;
        assert_eq!(batches.len(), 2);
        let first = batches[0].as_ref().unwrap();
        assert_eq!(first.bars.len(), 2);
        let second = batches[1].as_ref().unwrap();
        assert_eq!(second.bars.len(), 1);
        assert!(first.bars[0].timestamp_utc_ms < second.bars[0].timestamp_utc_ms);
    }

    #[tokio::test]
    async fn backfill_filters_symbols_and_validates_window() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway
            .persist_bars(&[bar(31, "AAPL"), bar(31, "MSFT")])
            .await
            .unwrap();
        let service = BackfillService::new(gateway);

        let response = service
            .backfill(Request::new(pb::BackfillRequest {
                start_utc_ms: Utc
                    .with_ymd_and_hms(2026, 3, 2, 14, 30, 0)
                    .unwrap()
                    .timestamp_millis(),
                end_utc_ms: Utc
                    .with_ymd_and_hms(2026, 3, 2, 14, 32, 0)
                    .unwrap()
                    .timestamp_millis(),
                symbols: vec!["MSFT".to_string()],
            }))
            .await
            .unwrap();
        let batches: Vec<_> = response.into_inner().collect().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_ref().unwrap().bars[0].symbol, "MSFT");

        let err = service
            .backfill(Request::new(pb::BackfillRequest {
                start_utc_ms: 10,
                end_utc_ms: 10,
                symbols: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
