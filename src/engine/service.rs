use chrono::Utc;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::{
    domain::{
        OrderId, Price, Quantity, RequestId, Symbol,
        bar::MinuteBar,
        conviction::{Conviction, Urgency},
        order::{OrderType, Side},
    },
    engine::{
        coordinator::EngineHandle,
        state::{OrderSpec, SubmitOutcome},
    },
    error::{EngineError, SimdeskError},
    generated::simdesk::v1::{
        self as pb,
        exchange_simulator_server::ExchangeSimulator,
        market_data_feed_server::MarketDataFeed,
    },
};

/// gRPC surface of one simulator process.
///
/// Handlers translate wire requests into coordinator commands; business
/// failures come back as unsuccessful responses, never as INTERNAL RPC
/// errors. A dead coordinator is the one fatal condition: it trips the
/// process shutdown token so the orchestrator can recreate the pod.
pub struct SimulatorService {
    handle: EngineHandle,
    fatal: CancellationToken,
}

impl SimulatorService {
    pub fn new(handle: EngineHandle, fatal: CancellationToken) -> Self {
        Self { handle, fatal }
    }

    fn check_session(&self, session_id: &str) -> Result<(), Status> {
        if session_id != self.handle.session_id().0 {
            return Err(Status::permission_denied(format!(
                "simulator serves session {}, not {session_id}",
                self.handle.session_id()
            )));
        }
        Ok(())
    }

    /// A gone coordinator is unrecoverable for this process.
    fn fatal_unavailable(&self, err: SimdeskError) -> Status {
        if matches!(err, SimdeskError::Engine(EngineError::CoordinatorGone(_))) {
            error!(error = %err, "engine coordinator lost, flagging process for restart");
            self.fatal.cancel();
        }
        Status::from(err)
    }
}

#[tonic::async_trait]
impl ExchangeSimulator for SimulatorService {
    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.check_session(&req.session_id)?;
        let server_ts = self
            .handle
            .heartbeat(req.client_timestamp_ms)
            .await
            .map_err(|e| self.fatal_unavailable(e))?;
        Ok(Response::new(pb::HeartbeatResponse {
            ok: true,
            server_timestamp_ms: server_ts,
        }))
    }

    type StreamExchangeDataStream = ReceiverStream<Result<pb::ExchangeDataUpdate, Status>>;

    async fn stream_exchange_data(
        &self,
        request: Request<pb::StreamRequest>,
    ) -> Result<Response<Self::StreamExchangeDataStream>, Status> {
        let req = request.into_inner();
        self.check_session(&req.session_id)?;
        info!(symbols = ?req.symbols, "exchange data stream opened");

        let mut frames = self
            .handle
            .subscribe()
            .await
            .map_err(|e| self.fatal_unavailable(e))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn submit_order(
        &self,
        request: Request<pb::SubmitOrderRequest>,
    ) -> Result<Response<pb::SubmitOrderResponse>, Status> {
        let req = request.into_inner();
        self.check_session(&req.session_id)?;

        let spec = match parse_order_spec(&req) {
            Ok(spec) => spec,
            Err(message) => {
                return Ok(Response::new(pb::SubmitOrderResponse {
                    success: false,
                    order_id: String::new(),
                    error_message: message,
                }));
            }
        };

        let outcome = self
            .handle
            .submit_order(spec)
            .await
            .map_err(|e| self.fatal_unavailable(e))?;

        let response = match outcome {
            SubmitOutcome::Accepted { order_id } | SubmitOutcome::Replayed { order_id } => {
                pb::SubmitOrderResponse {
                    success: true,
                    order_id: order_id.to_string(),
                    error_message: String::new(),
                }
            }
            SubmitOutcome::Rejected { order_id, error } => pb::SubmitOrderResponse {
                success: false,
                order_id: order_id.map(|id| id.to_string()).unwrap_or_default(),
                error_message: error,
            },
        };
        Ok(Response::new(response))
    }

    async fn cancel_order(
        &self,
        request: Request<pb::CancelOrderRequest>,
    ) -> Result<Response<pb::CancelOrderResponse>, Status> {
        let req = request.into_inner();
        self.check_session(&req.session_id)?;

        let result = self
            .handle
            .cancel_order(OrderId::from(req.order_id.as_str()))
            .await;
        let response = match result {
            Ok(()) => pb::CancelOrderResponse {
                success: true,
                error_message: String::new(),
            },
            Err(err @ SimdeskError::Engine(EngineError::CoordinatorGone(_))) => {
                return Err(self.fatal_unavailable(err));
            }
            Err(err) => pb::CancelOrderResponse {
                success: false,
                error_message: err.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn submit_conviction(
        &self,
        request: Request<pb::SubmitConvictionRequest>,
    ) -> Result<Response<pb::SubmitConvictionResponse>, Status> {
        let req = request.into_inner();
        self.check_session(&req.session_id)?;

        // Slots keep results in input order; parse failures land at their
        // own index, pipeline results fill the rest positionally.
        let mut slots: Vec<Option<pb::ConvictionResult>> =
            Vec::with_capacity(req.convictions.len());
        let mut parsed = Vec::new();
        for item in &req.convictions {
            match parse_conviction(item) {
                Ok(conviction) => {
                    parsed.push(conviction);
                    slots.push(None);
                }
                Err(message) => {
                    warn!(conviction_id = %item.conviction_id, error = %message, "conviction rejected");
                    slots.push(Some(pb::ConvictionResult {
                        conviction_id: item.conviction_id.clone(),
                        success: false,
                        order_ids: Vec::new(),
                        error_message: message,
                    }));
                }
            }
        }

        let outcome = self
            .handle
            .submit_convictions(parsed)
            .await
            .map_err(|e| self.fatal_unavailable(e))?;

        let mut pipeline_results = outcome.results.into_iter();
        let results = slots
            .into_iter()
            .map(|slot| {
                slot.or_else(|| {
                    pipeline_results.next().map(|entry| pb::ConvictionResult {
                        conviction_id: entry.conviction_id,
                        success: entry.success,
                        order_ids: entry.order_ids.iter().map(|id| id.to_string()).collect(),
                        error_message: entry.error.unwrap_or_default(),
                    })
                })
                .unwrap_or_default()
            })
            .collect();

        Ok(Response::new(pb::SubmitConvictionResponse {
            results,
            decision_log: outcome.decision_log,
        }))
    }
}

/// Ingest side of the simulator: minute bars pushed by the distributor.
pub struct MarketDataFeedService {
    handle: EngineHandle,
}

impl MarketDataFeedService {
    pub fn new(handle: EngineHandle) -> Self {
        Self { handle }
    }
}

#[tonic::async_trait]
impl MarketDataFeed for MarketDataFeedService {
    async fn publish_bars(
        &self,
        request: Request<pb::MinuteBarBatch>,
    ) -> Result<Response<pb::PublishAck>, Status> {
        let batch = request.into_inner();
        let mut bars = Vec::with_capacity(batch.bars.len());
        for raw in batch.bars {
            bars.push(MinuteBar::try_from(raw).map_err(Status::from)?);
        }
        self.handle
            .publish_bars(bars)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::PublishAck { ok: true }))
    }
}

fn parse_order_spec(req: &pb::SubmitOrderRequest) -> Result<OrderSpec, String> {
    let side =
        Side::from_str(&req.side).map_err(|_| format!("unknown order side '{}'", req.side))?;
    let order_type = OrderType::from_str(&req.order_type)
        .map_err(|_| format!("unknown order type '{}'", req.order_type))?;
    if req.symbol.is_empty() {
        return Err("symbol must not be empty".to_string());
    }
    Ok(OrderSpec {
        symbol: Symbol::from(req.symbol.as_str()),
        side,
        order_type,
        quantity: Quantity(req.quantity),
        price: (req.price > 0.0).then_some(Price(req.price)),
        request_id: (!req.request_id.is_empty())
            .then(|| RequestId::from(req.request_id.as_str())),
    })
}

fn parse_conviction(item: &pb::ConvictionItem) -> Result<Conviction, String> {
    let urgency = if item.urgency.is_empty() {
        Urgency::Medium
    } else {
        Urgency::from_str(&item.urgency)
            .map_err(|_| format!("unknown urgency '{}'", item.urgency))?
    };
    if item.symbol.is_empty() {
        return Err("symbol must not be empty".to_string());
    }
    let conviction_id = if item.conviction_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        item.conviction_id.clone()
    };
    Ok(Conviction {
        conviction_id,
        symbol: Symbol::from(item.symbol.as_str()),
        // Zero-valued fields are wire defaults, i.e. unset.
        target_weight: (item.target_weight != 0.0).then_some(item.target_weight),
        target_notional: (item.target_notional != 0.0).then_some(item.target_notional),
        score: (item.score != 0.0).then_some(item.score),
        urgency,
    })
}
