#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::async_trait;

use simdesk::{
    config::{EngineConfig, GatewayConfig},
    domain::{Price, Quantity, SessionId, Symbol, UserId, bar::MinuteBar},
    engine::{
        EngineCoordinator, EngineState,
        coordinator::{EngineHandle, NoBackfill},
        service::SimulatorService,
    },
    error::SimdeskResult,
    external::{NoopEmailGateway, StaticAuthClient},
    gateway::{GatewayState, routing::SimulatorRouter},
    generated::simdesk::v1::{self as pb, exchange_simulator_server::ExchangeSimulator},
    storage::memory::{MemoryCoordinationStore, MemoryGateway},
};

pub fn bar(symbol: &str, close: f64, minute: u32) -> MinuteBar {
    MinuteBar {
        symbol: Symbol::from(symbol),
        timestamp_utc: Utc.with_ymd_and_hms(2026, 3, 2, 14, minute, 0).unwrap(),
        open: Price(close),
        high: Price(close),
        low: Price(close),
        close: Price(close),
        volume: Quantity(50_000.0),
        vwap: Price(close),
    }
}

/// A real engine coordinator plus its gRPC service, run in-process.
pub struct TestExchange {
    pub handle: EngineHandle,
    pub service: Arc<SimulatorService>,
    pub shutdown: CancellationToken,
}

impl TestExchange {
    pub fn spawn(session_id: &str, user_id: &str, gateway: Arc<MemoryGateway>) -> Self {
        let cfg = EngineConfig {
            spread: 0.0,
            fee_bps: 0.0,
            ..EngineConfig::default()
        };
        let shutdown = CancellationToken::new();
        let handle = EngineCoordinator::spawn(
            EngineState::new(SessionId::from(session_id), UserId::from(user_id), cfg),
            gateway,
            Arc::new(NoBackfill),
            shutdown.clone(),
        );
        let service = Arc::new(SimulatorService::new(handle.clone(), shutdown.clone()));
        Self {
            handle,
            service,
            shutdown,
        }
    }

    /// Feeds one minute bar and waits for the engine to absorb it.
    pub async fn feed(&self, minute_bar: MinuteBar) {
        self.handle.publish_bars(vec![minute_bar]).await.unwrap();
        // The snapshot round-trips through the coordinator, so once it
        // answers, the bar has been applied.
        let _ = self.handle.portfolio_snapshot().await.unwrap();
    }
}

/// Routes gateway traffic straight into an in-process simulator service.
pub struct LoopbackRouter {
    pub service: Arc<SimulatorService>,
}

#[async_trait]
impl SimulatorRouter for LoopbackRouter {
    async fn submit_order(
        &self,
        _endpoint: &str,
        request: pb::SubmitOrderRequest,
    ) -> SimdeskResult<pb::SubmitOrderResponse> {
        Ok(self
            .service
            .submit_order(Request::new(request))
            .await
            .map_err(simdesk::error::TransportError::Status)?
            .into_inner())
    }

    async fn cancel_order(
        &self,
        _endpoint: &str,
        request: pb::CancelOrderRequest,
    ) -> SimdeskResult<pb::CancelOrderResponse> {
        Ok(self
            .service
            .cancel_order(Request::new(request))
            .await
            .map_err(simdesk::error::TransportError::Status)?
            .into_inner())
    }

    async fn submit_convictions(
        &self,
        _endpoint: &str,
        request: pb::SubmitConvictionRequest,
    ) -> SimdeskResult<pb::SubmitConvictionResponse> {
        Ok(self
            .service
            .submit_conviction(Request::new(request))
            .await
            .map_err(simdesk::error::TransportError::Status)?
            .into_inner())
    }
}

/// Gateway wired to the shared in-memory stores and a loopback simulator.
pub fn gateway_state(
    storage: Arc<MemoryGateway>,
    coordination: Arc<MemoryCoordinationStore>,
    exchange: &TestExchange,
) -> GatewayState {
    let auth = StaticAuthClient::new()
        .with_token("tok-u1", "u1", "trader")
        .with_token("tok-u2", "u2", "trader");
    GatewayState::new(
        GatewayConfig::default(),
        Arc::new(auth),
        storage,
        coordination,
        Arc::new(LoopbackRouter {
            service: exchange.service.clone(),
        }),
        Arc::new(NoopEmailGateway),
    )
}
