use chrono::Utc;
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::{debug, error, info, warn};

use crate::{
    domain::{OrderId, SessionId, UserId, bar::MinuteBar, conviction::Conviction},
    engine::{
        pipeline::ConvictionOutcome,
        replay::{GateAction, ReplayGate},
        state::{EngineState, OrderSpec, SubmitOutcome},
    },
    error::{EngineError, SimdeskResult},
    generated::simdesk::v1 as pb,
    storage::DatabaseGateway,
};

const COMMAND_BUFFER: usize = 64;
const STREAM_BUFFER: usize = 64;

/// Source of back-fill bars for gap replay (C5 in production, a stub in tests).
#[async_trait]
pub trait BackfillSource: Send + Sync + 'static {
    async fn backfill(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> SimdeskResult<Vec<MinuteBar>>;
}

/// Back-fill source that always returns nothing; replay degrades to a drain.
pub struct NoBackfill;

#[async_trait]
impl BackfillSource for NoBackfill {
    async fn backfill(
        &self,
        _start: chrono::DateTime<Utc>,
        _end: chrono::DateTime<Utc>,
    ) -> SimdeskResult<Vec<MinuteBar>> {
        Ok(Vec::new())
    }
}

/// Back-fill from the market-data distributor over gRPC.
pub struct GrpcBackfill {
    endpoint: String,
}

impl GrpcBackfill {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BackfillSource for GrpcBackfill {
    async fn backfill(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> SimdeskResult<Vec<MinuteBar>> {
        use crate::error::TransportError;
        use crate::generated::simdesk::v1 as pb;
        use crate::generated::simdesk::v1::market_data_distributor_client::MarketDataDistributorClient;

        let mut client = MarketDataDistributorClient::connect(self.endpoint.clone())
            .await
            .map_err(TransportError::Grpc)?;
        let mut stream = client
            .backfill(pb::BackfillRequest {
                start_utc_ms: start.timestamp_millis(),
                end_utc_ms: end.timestamp_millis(),
                symbols: Vec::new(),
            })
            .await
            .map_err(TransportError::Status)?
            .into_inner();

        let mut bars = Vec::new();
        while let Some(batch) = stream.message().await.map_err(TransportError::Status)? {
            for raw in batch.bars {
                bars.push(MinuteBar::try_from(raw)?);
            }
        }
        Ok(bars)
    }
}

enum Command {
    Heartbeat {
        client_ts_ms: i64,
        reply: oneshot::Sender<i64>,
    },
    SubmitOrder {
        spec: OrderSpec,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    CancelOrder {
        order_id: OrderId,
        reply: oneshot::Sender<SimdeskResult<()>>,
    },
    SubmitConvictions {
        convictions: Vec<Conviction>,
        reply: oneshot::Sender<ConvictionOutcome>,
    },
    Subscribe {
        reply: oneshot::Sender<SimdeskResult<mpsc::Receiver<pb::ExchangeDataUpdate>>>,
    },
    PublishBars {
        bars: Vec<MinuteBar>,
    },
    BackfillComplete {
        bars: Vec<MinuteBar>,
    },
    Snapshot {
        reply: oneshot::Sender<pb::PortfolioStatus>,
    },
}

/// Cloneable front to the coordinator task.
///
/// Every RPC handler and the market-data feed talk to the engine through
/// this; the coordinator applies commands one at a time, which is the whole
/// concurrency story for engine state.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    last_heartbeat_ms: Arc<AtomicI64>,
    session_id: SessionId,
    user_id: UserId,
}

impl EngineHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Milliseconds since the last heartbeat was received.
    pub fn idle_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    pub async fn heartbeat(&self, client_ts_ms: i64) -> SimdeskResult<i64> {
        self.request(|reply| Command::Heartbeat {
            client_ts_ms,
            reply,
        })
        .await
    }

    pub async fn submit_order(&self, spec: OrderSpec) -> SimdeskResult<SubmitOutcome> {
        self.request(|reply| Command::SubmitOrder { spec, reply }).await
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> SimdeskResult<()> {
        self.request(|reply| Command::CancelOrder { order_id, reply })
            .await?
    }

    pub async fn submit_convictions(
        &self,
        convictions: Vec<Conviction>,
    ) -> SimdeskResult<ConvictionOutcome> {
        self.request(|reply| Command::SubmitConvictions { convictions, reply })
            .await
    }

    pub async fn subscribe(&self) -> SimdeskResult<mpsc::Receiver<pb::ExchangeDataUpdate>> {
        self.request(|reply| Command::Subscribe { reply }).await?
    }

    pub async fn publish_bars(&self, bars: Vec<MinuteBar>) -> SimdeskResult<()> {
        self.tx
            .send(Command::PublishBars { bars })
            .await
            .map_err(|_| EngineError::CoordinatorGone("command channel closed".into()).into())
    }

    pub async fn portfolio_snapshot(&self) -> SimdeskResult<pb::PortfolioStatus> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SimdeskResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::CoordinatorGone("command channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::CoordinatorGone("coordinator dropped reply".to_string()).into())
    }
}

/// The per-session coordinator task.
pub struct EngineCoordinator {
    state: EngineState,
    gate: ReplayGate,
    rx: mpsc::Receiver<Command>,
    subscriber: Option<mpsc::Sender<pb::ExchangeDataUpdate>>,
    gateway: Arc<dyn DatabaseGateway>,
    backfill: Arc<dyn BackfillSource>,
    backfill_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl EngineCoordinator {
    /// Spawns the coordinator and returns its handle.
    pub fn spawn(
        state: EngineState,
        gateway: Arc<dyn DatabaseGateway>,
        backfill: Arc<dyn BackfillSource>,
        shutdown: CancellationToken,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let last_heartbeat_ms = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let handle = EngineHandle {
            tx: tx.clone(),
            last_heartbeat_ms: last_heartbeat_ms.clone(),
            session_id: state.session_id.clone(),
            user_id: state.user_id.clone(),
        };

        let gate = ReplayGate::new(
            state.config().gap_tolerance_secs,
            state.config().max_replay_gap_secs,
        );
        let coordinator = Self {
            state,
            gate,
            rx,
            subscriber: None,
            gateway,
            backfill,
            backfill_tx: tx,
            shutdown,
        };

        tokio::spawn(coordinator.run(last_heartbeat_ms));
        handle
    }

    async fn run(mut self, last_heartbeat_ms: Arc<AtomicI64>) {
        info!(session_id = %self.state.session_id, "engine coordinator started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(session_id = %self.state.session_id, "engine coordinator shutting down");
                    break;
                }
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command, &last_heartbeat_ms);
                }
            }
        }
    }

    /// Applies one command. Synchronous on purpose: no suspension can occur
    /// while engine state is mid-mutation.
    fn handle(&mut self, command: Command, last_heartbeat_ms: &AtomicI64) {
        match command {
            Command::Heartbeat {
                client_ts_ms,
                reply,
            } => {
                let server_ts = Utc::now().timestamp_millis();
                last_heartbeat_ms.store(server_ts, Ordering::Release);
                debug!(client_ts_ms, "heartbeat");
                let _ = reply.send(server_ts);
            }
            Command::SubmitOrder { spec, reply } => {
                let outcome = self.state.submit_order(spec, Utc::now());
                self.persist_order_outcome(&outcome);
                self.persist_flows();
                let _ = reply.send(outcome);
            }
            Command::CancelOrder { order_id, reply } => {
                let result = self.state.cancel_order(&order_id, Utc::now());
                if result.is_ok()
                    && let Some(order) = self.state.order(&order_id)
                {
                    self.spawn_record_order(order.clone());
                }
                let _ = reply.send(result);
            }
            Command::SubmitConvictions { convictions, reply } => {
                let outcome = self.state.submit_convictions(convictions, Utc::now());
                for result in &outcome.results {
                    for order_id in &result.order_ids {
                        if let Some(order) = self.state.order(order_id) {
                            self.spawn_record_order(order.clone());
                        }
                    }
                }
                self.persist_flows();
                let _ = reply.send(outcome);
            }
            Command::Subscribe { reply } => {
                let result = match &self.subscriber {
                    Some(existing) if !existing.is_closed() => {
                        Err(EngineError::StreamBusy.into())
                    }
                    _ => {
                        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                        self.subscriber = Some(tx);
                        Ok(rx)
                    }
                };
                let _ = reply.send(result);
            }
            Command::PublishBars { bars } => match self.gate.on_batch(bars) {
                GateAction::Process(batches) => self.process_batches(batches),
                GateAction::Queued => {}
                GateAction::RequestBackfill { start, end } => {
                    let source = self.backfill.clone();
                    let tx = self.backfill_tx.clone();
                    tokio::spawn(async move {
                        let bars = match source.backfill(start, end).await {
                            Ok(bars) => bars,
                            Err(err) => {
                                warn!(error = %err, "backfill failed, draining replay queue");
                                Vec::new()
                            }
                        };
                        let _ = tx.send(Command::BackfillComplete { bars }).await;
                    });
                }
            },
            Command::BackfillComplete { bars } => {
                let batches = self.gate.finish_replay(bars);
                self.process_batches(batches);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.portfolio_snapshot());
            }
        }
    }

    fn process_batches(&mut self, batches: Vec<Vec<MinuteBar>>) {
        for batch in batches {
            if batch.is_empty() {
                continue;
            }
            let frame = self.state.apply_bar_batch(&batch, Utc::now());
            self.persist_flows();
            self.emit(frame);
        }
    }

    /// Pushes a frame to the subscriber, if any. All mutations for the tick
    /// are committed before this point.
    fn emit(&mut self, frame: pb::ExchangeDataUpdate) {
        if let Some(subscriber) = &self.subscriber {
            match subscriber.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("stream subscriber went away");
                    self.subscriber = None;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("stream subscriber lagging, frame dropped");
                }
            }
        }
    }

    fn persist_order_outcome(&self, outcome: &SubmitOutcome) {
        let order_id = match outcome {
            SubmitOutcome::Accepted { order_id } => Some(order_id),
            SubmitOutcome::Rejected {
                order_id: Some(order_id),
                ..
            } => Some(order_id),
            _ => None,
        };
        if let Some(order_id) = order_id
            && let Some(order) = self.state.order(order_id)
        {
            self.spawn_record_order(order.clone());
        }
    }

    fn spawn_record_order(&self, order: crate::domain::order::Order) {
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            if let Err(err) = gateway.record_order(&order).await {
                error!(order_id = %order.order_id, error = %err, "failed to persist order");
            }
        });
    }

    fn persist_flows(&mut self) {
        let flows = self.state.unpersisted_flows();
        if flows.is_empty() {
            return;
        }
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            if let Err(err) = gateway.record_cash_flows(&flows).await {
                error!(error = %err, "failed to persist cash flows");
            }
        });
    }
}
