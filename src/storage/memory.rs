use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::async_trait;

use crate::{
    domain::{
        OrderId, SessionId, SimulatorId, UserId,
        account::CashFlow,
        bar::MinuteBar,
        order::Order,
        session::{Session, SessionStatus},
        simulator::{Simulator, SimulatorStatus},
    },
    error::{SimdeskResult, StorageError},
    storage::{
        BookRecord, CoordinationStore, DatabaseGateway, ExchangeRecord, FeedbackRecord,
        FundRecord, IdempotencyKind,
    },
};

#[derive(Default)]
struct GatewayState {
    sessions: HashMap<SessionId, Session>,
    session_status_log: Vec<SessionStatus>,
    simulators: HashMap<SimulatorId, Simulator>,
    orders: HashMap<OrderId, Order>,
    idempotency: HashMap<(UserId, IdempotencyKind, String), (String, DateTime<Utc>)>,
    bars: Vec<MinuteBar>,
    cash_flows: Vec<CashFlow>,
    exchanges: Vec<ExchangeRecord>,
    funds: HashMap<String, FundRecord>,
    books: HashMap<String, BookRecord>,
    feedback: Vec<FeedbackRecord>,
}

/// In-memory [`DatabaseGateway`] used by tests and local single-process runs.
#[derive(Default)]
pub struct MemoryGateway {
    state: RwLock<GatewayState>,
    fail_session_writes: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the exchange table, normally maintained by an external batch job.
    pub async fn seed_exchanges(&self, exchanges: Vec<ExchangeRecord>) {
        self.state.write().await.exchanges = exchanges;
    }

    pub async fn cash_flow_count(&self) -> usize {
        self.state.read().await.cash_flows.len()
    }

    /// Raw session lookup by id, regardless of status.
    pub async fn session_snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.state.read().await.sessions.get(session_id).cloned()
    }

    /// Makes subsequent session writes fail.
    pub fn fail_session_writes(&self, fail: bool) {
        self.fail_session_writes.store(fail, Ordering::SeqCst);
    }

    /// Statuses observed by `upsert_session`, in write order.
    pub async fn session_status_log(&self) -> Vec<SessionStatus> {
        self.state.read().await.session_status_log.clone()
    }
}

#[async_trait]
impl DatabaseGateway for MemoryGateway {
    async fn upsert_session(&self, session: &Session) -> SimdeskResult<()> {
        if self.fail_session_writes.load(Ordering::SeqCst) {
            return Err(
                StorageError::Backend("injected session write failure".to_string()).into(),
            );
        }
        let mut state = self.state.write().await;
        state.session_status_log.push(session.status);
        state
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn session_for_user(&self, user_id: &UserId) -> SimdeskResult<Option<Session>> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .values()
            .find(|s| &s.user_id == user_id && s.status.is_live())
            .cloned())
    }

    async fn delete_session(&self, session_id: &SessionId) -> SimdeskResult<()> {
        self.state.write().await.sessions.remove(session_id);
        Ok(())
    }

    async fn upsert_simulator(&self, simulator: &Simulator) -> SimdeskResult<()> {
        self.state
            .write()
            .await
            .simulators
            .insert(simulator.simulator_id.clone(), simulator.clone());
        Ok(())
    }

    async fn simulator(&self, simulator_id: &SimulatorId) -> SimdeskResult<Option<Simulator>> {
        Ok(self.state.read().await.simulators.get(simulator_id).cloned())
    }

    async fn simulator_for_user(&self, user_id: &UserId) -> SimdeskResult<Option<Simulator>> {
        Ok(self
            .state
            .read()
            .await
            .simulators
            .values()
            .find(|s| &s.user_id == user_id && !s.status.is_terminal())
            .cloned())
    }

    async fn mark_simulator_stopped(
        &self,
        simulator_id: &SimulatorId,
        reason: &str,
    ) -> SimdeskResult<()> {
        let mut state = self.state.write().await;
        let simulator = state
            .simulators
            .get_mut(simulator_id)
            .ok_or_else(|| StorageError::NotFound(format!("simulator {simulator_id}")))?;
        simulator.status = SimulatorStatus::Stopped;
        simulator.termination_reason = Some(reason.to_string());
        simulator.last_active = Utc::now();
        Ok(())
    }

    async fn record_order(&self, order: &Order) -> SimdeskResult<()> {
        self.state
            .write()
            .await
            .orders
            .insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn order(&self, order_id: &OrderId) -> SimdeskResult<Option<Order>> {
        Ok(self.state.read().await.orders.get(order_id).cloned())
    }

    async fn orders_for_session(&self, session_id: &SessionId) -> SimdeskResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| &o.session_id == session_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn idempotency_get(
        &self,
        user_id: &UserId,
        kind: IdempotencyKind,
        request_id: &str,
    ) -> SimdeskResult<Option<String>> {
        let key = (user_id.clone(), kind, request_id.to_string());
        let state = self.state.read().await;
        Ok(state.idempotency.get(&key).and_then(|(resp, expires)| {
            if *expires > Utc::now() {
                Some(resp.clone())
            } else {
                None
            }
        }))
    }

    async fn idempotency_put(
        &self,
        user_id: &UserId,
        kind: IdempotencyKind,
        request_id: &str,
        response: &str,
        ttl: Duration,
    ) -> SimdeskResult<()> {
        let key = (user_id.clone(), kind, request_id.to_string());
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.state
            .write()
            .await
            .idempotency
            .insert(key, (response.to_string(), expires));
        Ok(())
    }

    async fn persist_bars(&self, bars: &[MinuteBar]) -> SimdeskResult<()> {
        self.state.write().await.bars.extend_from_slice(bars);
        Ok(())
    }

    async fn bars_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SimdeskResult<Vec<MinuteBar>> {
        let mut bars: Vec<MinuteBar> = self
            .state
            .read()
            .await
            .bars
            .iter()
            .filter(|b| b.timestamp_utc > start && b.timestamp_utc <= end)
            .cloned()
            .collect();
        bars.sort_by_key(|b| b.timestamp_utc);
        Ok(bars)
    }

    async fn record_cash_flows(&self, flows: &[CashFlow]) -> SimdeskResult<()> {
        self.state
            .write()
            .await
            .cash_flows
            .extend_from_slice(flows);
        Ok(())
    }

    async fn active_exchanges(&self) -> SimdeskResult<Vec<ExchangeRecord>> {
        Ok(self.state.read().await.exchanges.clone())
    }

    async fn upsert_fund(&self, fund: &FundRecord) -> SimdeskResult<()> {
        self.state
            .write()
            .await
            .funds
            .insert(fund.fund_id.clone(), fund.clone());
        Ok(())
    }

    async fn fund(&self, fund_id: &str) -> SimdeskResult<Option<FundRecord>> {
        Ok(self.state.read().await.funds.get(fund_id).cloned())
    }

    async fn upsert_book(&self, book: &BookRecord) -> SimdeskResult<()> {
        self.state
            .write()
            .await
            .books
            .insert(book.book_id.clone(), book.clone());
        Ok(())
    }

    async fn book(&self, book_id: &str) -> SimdeskResult<Option<BookRecord>> {
        Ok(self.state.read().await.books.get(book_id).cloned())
    }

    async fn books_for_user(&self, user_id: &UserId) -> SimdeskResult<Vec<BookRecord>> {
        Ok(self
            .state
            .read()
            .await
            .books
            .values()
            .filter(|b| &b.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record_feedback(&self, feedback: &FeedbackRecord) -> SimdeskResult<()> {
        self.state.write().await.feedback.push(feedback.clone());
        Ok(())
    }
}

/// In-memory coordination store with SET-NX-with-TTL lock semantics.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    locks: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> SimdeskResult<bool> {
        let now = Utc::now();
        let expiry = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut locks = self.locks.write().await;
        match locks.get(key) {
            // A lease whose expiry has passed is implicitly released.
            Some((holder, held_until)) if *held_until > now && holder != owner => Ok(false),
            _ => {
                locks.insert(key.to_string(), (owner.to_string(), expiry));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> SimdeskResult<()> {
        let mut locks = self.locks.write().await;
        match locks.get(key) {
            Some((holder, _)) if holder == owner => {
                locks.remove(key);
                Ok(())
            }
            Some(_) => Err(StorageError::LockOwnership {
                key: key.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::domain::{DeviceId, session::SessionStatus};

    #[tokio::test]
    async fn one_live_session_per_user() {
        let gateway = MemoryGateway::new();
        let user = UserId::from("u1");
        let mut session = Session::open(
            user.clone(),
            DeviceId::from("d1"),
            "pod",
            ChronoDuration::seconds(120),
            Utc::now(),
        );
        gateway.upsert_session(&session).await.unwrap();
        assert!(gateway.session_for_user(&user).await.unwrap().is_some());

        session.status = SessionStatus::Expired;
        gateway.upsert_session(&session).await.unwrap();
        assert!(gateway.session_for_user(&user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotency_expires() {
        let gateway = MemoryGateway::new();
        let user = UserId::from("u1");
        gateway
            .idempotency_put(&user, IdempotencyKind::Order, "r1", "resp", Duration::ZERO)
            .await
            .unwrap();
        // Zero TTL entries are already expired.
        assert!(
            gateway
                .idempotency_get(&user, IdempotencyKind::Order, "r1")
                .await
                .unwrap()
                .is_none()
        );

        gateway
            .idempotency_put(
                &user,
                IdempotencyKind::Order,
                "r1",
                "resp",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(
            gateway
                .idempotency_get(&user, IdempotencyKind::Order, "r1")
                .await
                .unwrap()
                .as_deref(),
            Some("resp")
        );
        // Same request id under a different kind is a distinct key.
        assert!(
            gateway
                .idempotency_get(&user, IdempotencyKind::Conviction, "r1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn lock_round_trip_and_ownership() {
        let store = MemoryCoordinationStore::new();
        assert!(store.acquire("user:u1", "a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.acquire("user:u1", "b", Duration::from_secs(30)).await.unwrap());

        // Wrong owner cannot release.
        assert!(store.release("user:u1", "b").await.is_err());
        store.release("user:u1", "a").await.unwrap();
        assert!(store.acquire("user:u1", "b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_implicitly_released() {
        let store = MemoryCoordinationStore::new();
        assert!(store.acquire("k", "a", Duration::ZERO).await.unwrap());
        assert!(store.acquire("k", "b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn mark_simulator_stopped_records_reason() {
        let gateway = MemoryGateway::new();
        let sim = Simulator::new(
            SessionId::from("s1"),
            UserId::from("u1"),
            "http://127.0.0.1:50060",
            Utc::now(),
        );
        gateway.upsert_simulator(&sim).await.unwrap();
        gateway
            .mark_simulator_stopped(&sim.simulator_id, "session TTL expired")
            .await
            .unwrap();

        let stored = gateway.simulator(&sim.simulator_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SimulatorStatus::Stopped);
        assert!(
            stored
                .termination_reason
                .as_deref()
                .unwrap()
                .contains("TTL")
        );
    }
}
