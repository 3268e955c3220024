pub mod memory;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use tonic::async_trait;

use crate::{
    domain::{
        OrderId, SessionId, SimulatorId, UserId,
        account::CashFlow,
        bar::MinuteBar,
        order::Order,
        session::Session,
        simulator::Simulator,
    },
    error::SimdeskResult,
};

/// An exchange known to the control plane.
///
/// `pre_open`/`post_close` bound the window in which simulator pods for this
/// exchange should be running; all four times are in the exchange's own
/// timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub exch_id: String,
    pub timezone: String,
    pub pre_open: NaiveTime,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub post_close: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundRecord {
    pub fund_id: String,
    pub user_id: UserId,
    pub name: String,
    pub base_currency: String,
    pub aum: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub book_id: String,
    pub user_id: UserId,
    pub fund_id: String,
    pub name: String,
    pub strategy: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub user_id: UserId,
    pub category: String,
    pub message: String,
    pub submitted_at: DateTime<Utc>,
}

/// Namespace for idempotency keys.
///
/// Orders and convictions are logically distinct: a request id replayed
/// across kinds is a miss by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum IdempotencyKind {
    Order,
    Conviction,
}

/// Single gateway to persistent state, grouped by concern.
///
/// Real deployments back this with a relational database; the in-memory
/// implementation in [`memory`] serves tests and local development. Callers
/// hold the gateway behind an `Arc` and never see pool or connection details.
#[async_trait]
pub trait DatabaseGateway: Send + Sync + 'static {
    // === Sessions ===

    async fn upsert_session(&self, session: &Session) -> SimdeskResult<()>;

    async fn session_for_user(&self, user_id: &UserId) -> SimdeskResult<Option<Session>>;

    async fn delete_session(&self, session_id: &SessionId) -> SimdeskResult<()>;

    // === Simulators ===

    async fn upsert_simulator(&self, simulator: &Simulator) -> SimdeskResult<()>;

    async fn simulator(&self, simulator_id: &SimulatorId) -> SimdeskResult<Option<Simulator>>;

    async fn simulator_for_user(&self, user_id: &UserId) -> SimdeskResult<Option<Simulator>>;

    /// Marks the simulator STOPPED with a termination reason. Used by the TTL
    /// watchdog on self-termination, so it must not require a live session.
    async fn mark_simulator_stopped(
        &self,
        simulator_id: &SimulatorId,
        reason: &str,
    ) -> SimdeskResult<()>;

    // === Orders ===

    async fn record_order(&self, order: &Order) -> SimdeskResult<()>;

    async fn order(&self, order_id: &OrderId) -> SimdeskResult<Option<Order>>;

    async fn orders_for_session(&self, session_id: &SessionId) -> SimdeskResult<Vec<Order>>;

    // === Request idempotency ===

    async fn idempotency_get(
        &self,
        user_id: &UserId,
        kind: IdempotencyKind,
        request_id: &str,
    ) -> SimdeskResult<Option<String>>;

    async fn idempotency_put(
        &self,
        user_id: &UserId,
        kind: IdempotencyKind,
        request_id: &str,
        response: &str,
        ttl: Duration,
    ) -> SimdeskResult<()>;

    // === Market data ===

    async fn persist_bars(&self, bars: &[MinuteBar]) -> SimdeskResult<()>;

    async fn bars_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SimdeskResult<Vec<MinuteBar>>;

    // === Cash flows ===

    async fn record_cash_flows(&self, flows: &[CashFlow]) -> SimdeskResult<()>;

    // === Exchanges ===

    async fn active_exchanges(&self) -> SimdeskResult<Vec<ExchangeRecord>>;

    // === Funds / books / feedback ===

    async fn upsert_fund(&self, fund: &FundRecord) -> SimdeskResult<()>;

    async fn fund(&self, fund_id: &str) -> SimdeskResult<Option<FundRecord>>;

    async fn upsert_book(&self, book: &BookRecord) -> SimdeskResult<()>;

    async fn book(&self, book_id: &str) -> SimdeskResult<Option<BookRecord>>;

    async fn books_for_user(&self, user_id: &UserId) -> SimdeskResult<Vec<BookRecord>>;

    async fn record_feedback(&self, feedback: &FeedbackRecord) -> SimdeskResult<()>;
}

/// Distributed-lock facade over the coordination store.
///
/// Semantics follow SET-NX-with-TTL: acquisition installs `(owner, expiry)`
/// atomically if the key is free or expired; release validates the ownership
/// token so an expired-and-reacquired lock cannot be released by its previous
/// holder.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Attempts to take the lock. Returns `false` when it is currently held
    /// by another owner.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> SimdeskResult<bool>;

    /// Releases the lock if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> SimdeskResult<()>;
}
