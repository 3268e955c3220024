//! Session lifecycle: device binding, replacement and simulator coordination.

mod common;

use futures::{StreamExt, stream::BoxStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::async_trait;

use common::{TestExchange, bar};
use simdesk::{
    config::SessionConfig,
    domain::{DeviceId, SessionId, SimulatorId, UserId, session::SessionStatus},
    error::SimdeskResult,
    generated::simdesk::v1 as pb,
    session::{
        SessionManager, SimulatorOps, SimulatorProvisioner,
        manager::SocketCommand,
        protocol::{CLOSE_CONNECTION_REPLACED, ServerMessage},
        simulator_ops::StartOutcome,
        stream::SimulatorLink,
    },
    storage::{DatabaseGateway, memory::MemoryGateway},
};

/// Link that talks to an in-process engine coordinator.
struct LoopbackLink {
    exchange: Arc<TestExchange>,
}

#[async_trait]
impl SimulatorLink for LoopbackLink {
    async fn heartbeat(&self, _endpoint: &str, _session_id: &SessionId) -> SimdeskResult<()> {
        self.exchange
            .handle
            .heartbeat(chrono::Utc::now().timestamp_millis())
            .await
            .map(|_| ())
    }

    async fn open_stream(
        &self,
        _endpoint: &str,
        _session_id: &SessionId,
        _symbols: Vec<String>,
    ) -> SimdeskResult<BoxStream<'static, SimdeskResult<pb::ExchangeDataUpdate>>> {
        let receiver = self.exchange.handle.subscribe().await?;
        Ok(tokio_stream::wrappers::ReceiverStream::new(receiver)
            .map(Ok)
            .boxed())
    }
}

struct LoopbackProvisioner;

#[async_trait]
impl SimulatorProvisioner for LoopbackProvisioner {
    async fn provision(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> SimdeskResult<simdesk::domain::simulator::Simulator> {
        Ok(simdesk::domain::simulator::Simulator::new(
            session_id.clone(),
            user_id.clone(),
            "http://127.0.0.1:50060",
            chrono::Utc::now(),
        ))
    }

    async fn teardown(&self, _simulator_id: &SimulatorId) -> SimdeskResult<()> {
        Ok(())
    }
}

fn manager_with(storage: Arc<MemoryGateway>) -> Arc<SessionManager> {
    let cfg = SessionConfig {
        reconnect_timeout: Duration::from_millis(40),
        ..SessionConfig::default()
    };
    Arc::new(SessionManager::new(cfg, storage))
}

#[tokio::test]
async fn device_replacement_keeps_simulator_and_blocks_old_device() {
    let storage = Arc::new(MemoryGateway::new());
    let manager = manager_with(storage.clone());

    let (d1_tx, mut d1_rx) = mpsc::channel(8);
    let first = manager
        .connect(UserId::from("u1"), DeviceId::from("d1"), None, d1_tx)
        .await
        .unwrap();

    let (d2_tx, _d2_rx) = mpsc::channel(8);
    let second = manager
        .connect(UserId::from("u1"), DeviceId::from("d2"), None, d2_tx)
        .await
        .unwrap();

    // Old socket receives connection_replaced with the new device info, then
    // the 4000 close.
    let SocketCommand::Send(ServerMessage::ConnectionReplaced {
        new_device_info, ..
    }) = d1_rx.recv().await.unwrap()
    else {
        panic!("expected connection_replaced first");
    };
    assert_eq!(new_device_info.unwrap()["deviceId"], "d2");
    assert_eq!(
        d1_rx.recv().await.unwrap(),
        SocketCommand::Close {
            code: CLOSE_CONNECTION_REPLACED
        }
    );

    // Same session and simulator binding, new device.
    assert_eq!(first.session.session_id, second.session.session_id);
    assert_eq!(second.session.device_id, DeviceId::from("d2"));

    // The persisted session now rejects d1: this is what fails an order
    // attempt from the displaced device with AUTHORIZATION upstream.
    let stored = storage
        .session_for_user(&UserId::from("u1"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(stored.device_id, DeviceId::from("d1"));
    assert_eq!(stored.device_id, DeviceId::from("d2"));
}

#[tokio::test]
async fn reconnect_grace_expires_into_session_teardown() {
    let storage = Arc::new(MemoryGateway::new());
    let manager = manager_with(storage.clone());

    let (tx, _rx) = mpsc::channel(8);
    let outcome = manager
        .connect(UserId::from("u1"), DeviceId::from("d1"), None, tx)
        .await
        .unwrap();
    manager.disconnect(&UserId::from("u1"), outcome.epoch).await;

    assert_eq!(
        manager.session(&UserId::from("u1")).await.unwrap().status,
        SessionStatus::Reconnecting
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.session(&UserId::from("u1")).await.is_none());

    let stored = storage.session_snapshot(&outcome.session.session_id).await;
    assert_eq!(stored.unwrap().status, SessionStatus::Expired);

    // The run-down was persisted step by step:
    // ACTIVE → RECONNECTING → INACTIVE → EXPIRED.
    let log = storage.session_status_log().await;
    let reconnecting = log
        .iter()
        .position(|s| *s == SessionStatus::Reconnecting)
        .expect("RECONNECTING was persisted");
    let inactive = log
        .iter()
        .position(|s| *s == SessionStatus::Inactive)
        .expect("INACTIVE was persisted");
    let expired = log
        .iter()
        .position(|s| *s == SessionStatus::Expired)
        .expect("EXPIRED was persisted");
    assert!(reconnecting < inactive);
    assert!(inactive < expired);
}

#[tokio::test]
async fn start_simulator_streams_frames_to_socket() {
    let storage = Arc::new(MemoryGateway::new());
    let exchange = Arc::new(TestExchange::spawn("s1", "u1", storage.clone()));
    let link = Arc::new(LoopbackLink {
        exchange: exchange.clone(),
    });
    let ops = Arc::new(SimulatorOps::new(
        storage.clone(),
        Arc::new(LoopbackProvisioner),
        link.clone(),
        Duration::from_secs(2),
    ));
    let manager = manager_with(storage.clone());

    let (tx, mut rx) = mpsc::channel(32);
    let outcome = manager
        .connect(UserId::from("u1"), DeviceId::from("d1"), None, tx)
        .await
        .unwrap();

    let StartOutcome::Ready(simulator) = ops
        .start_simulator(&outcome.session.session_id, &UserId::from("u1"))
        .await
        .unwrap()
    else {
        panic!("expected a running simulator");
    };

    simdesk::session::stream::spawn_relay(
        manager.clone(),
        link,
        simulator.endpoint.clone(),
        outcome.session.session_id.clone(),
        UserId::from("u1"),
        Duration::from_secs(5),
        tokio_util::sync::CancellationToken::new(),
    );
    // Let the relay task attach its stream subscriber before feeding.
    tokio::time::sleep(Duration::from_millis(50)).await;

    exchange.feed(bar("AAPL", 100.0, 30)).await;

    let frame = loop {
        match rx.recv().await.unwrap() {
            SocketCommand::Send(ServerMessage::ExchangeData { frame }) => break frame,
            _ => continue,
        }
    };
    assert_eq!(frame.update_id, 1);
    assert_eq!(frame.market_data[0].symbol, "AAPL");
}
