use futures::{StreamExt, stream::BoxStream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::{debug, info, warn};

use crate::{
    domain::{SessionId, UserId},
    error::{SimdeskResult, TransportError},
    generated::simdesk::v1::{self as pb, exchange_simulator_client::ExchangeSimulatorClient},
    session::{manager::SessionManager, protocol::ServerMessage},
};

/// Heartbeat failures tolerated before the simulator is declared lost.
const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// The session pod's view of one simulator's gRPC surface.
#[async_trait]
pub trait SimulatorLink: Send + Sync + 'static {
    async fn heartbeat(&self, endpoint: &str, session_id: &SessionId) -> SimdeskResult<()>;

    async fn open_stream(
        &self,
        endpoint: &str,
        session_id: &SessionId,
        symbols: Vec<String>,
    ) -> SimdeskResult<BoxStream<'static, SimdeskResult<pb::ExchangeDataUpdate>>>;
}

/// tonic-backed link used in production.
pub struct GrpcSimulatorLink;

#[async_trait]
impl SimulatorLink for GrpcSimulatorLink {
    async fn heartbeat(&self, endpoint: &str, session_id: &SessionId) -> SimdeskResult<()> {
        let mut client = ExchangeSimulatorClient::connect(endpoint.to_string())
            .await
            .map_err(TransportError::Grpc)?;
        let response = client
            .heartbeat(pb::HeartbeatRequest {
                session_id: session_id.to_string(),
                client_timestamp_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await
            .map_err(TransportError::Status)?;
        if response.into_inner().ok {
            Ok(())
        } else {
            Err(TransportError::Status(tonic::Status::unavailable("heartbeat refused")).into())
        }
    }

    async fn open_stream(
        &self,
        endpoint: &str,
        session_id: &SessionId,
        symbols: Vec<String>,
    ) -> SimdeskResult<BoxStream<'static, SimdeskResult<pb::ExchangeDataUpdate>>> {
        let mut client = ExchangeSimulatorClient::connect(endpoint.to_string())
            .await
            .map_err(TransportError::Grpc)?;
        let stream = client
            .stream_exchange_data(pb::StreamRequest {
                session_id: session_id.to_string(),
                symbols,
            })
            .await
            .map_err(TransportError::Status)?
            .into_inner();
        Ok(stream
            .map(|item| item.map_err(|status| TransportError::Status(status).into()))
            .boxed())
    }
}

/// Runs the simulator-to-client relay for one session.
///
/// Two tasks: the stream pump re-emits every `ExchangeDataUpdate` frame as a
/// WS `exchange_data` message, and the heartbeat pump keeps the simulator's
/// TTL alive. Either failing marks the session `simulator_lost`; client WS
/// close cancels both through the token within one heartbeat period.
pub fn spawn_relay(
    manager: Arc<SessionManager>,
    link: Arc<dyn SimulatorLink>,
    endpoint: String,
    session_id: SessionId,
    user_id: UserId,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    let stream_cancel = cancel.clone();
    let stream_manager = manager.clone();
    let stream_link = link.clone();
    let stream_endpoint = endpoint.clone();
    let stream_session = session_id.clone();
    let stream_user = user_id.clone();
    tokio::spawn(async move {
        let mut frames = match stream_link
            .open_stream(&stream_endpoint, &stream_session, Vec::new())
            .await
        {
            Ok(frames) => frames,
            Err(err) => {
                warn!(error = %err, "failed to open exchange stream");
                stream_manager.mark_simulator_lost(&stream_user).await;
                return;
            }
        };
        info!(session_id = %stream_session, endpoint = %stream_endpoint, "exchange stream relay started");

        loop {
            tokio::select! {
                _ = stream_cancel.cancelled() => {
                    debug!(session_id = %stream_session, "stream relay cancelled");
                    return;
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(update)) => {
                            let message = ServerMessage::ExchangeData { frame: update.into() };
                            if !stream_manager.push(&stream_user, message).await {
                                debug!(session_id = %stream_session, "no live socket for frame");
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "exchange stream error");
                            stream_manager.mark_simulator_lost(&stream_user).await;
                            return;
                        }
                        None => {
                            warn!(session_id = %stream_session, "exchange stream ended");
                            stream_manager.mark_simulator_lost(&stream_user).await;
                            return;
                        }
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(heartbeat_interval) => {}
            }
            match link.heartbeat(&endpoint, &session_id).await {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures += 1;
                    warn!(error = %err, failures, "simulator heartbeat failed");
                    if failures >= MAX_HEARTBEAT_FAILURES {
                        manager.mark_simulator_lost(&user_id).await;
                        return;
                    }
                }
            }
        }
    });
}


#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::{tests_support::StubLink, *};
    use crate::{
        config::SessionConfig,
        domain::DeviceId,
        session::manager::SocketCommand,
        storage::memory::MemoryGateway,
    };

    fn frame(update_id: u64) -> pb::ExchangeDataUpdate {
        pb::ExchangeDataUpdate {
            update_id,
            timestamp_ms: 0,
            market_data: vec![],
            orders_data: vec![],
            portfolio: None,
        }
    }

    #[tokio::test]
    async fn frames_are_relayed_to_the_socket() {
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default(),
            Arc::new(MemoryGateway::new()),
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = manager
            .connect(UserId::from("u1"), DeviceId::from("d1"), None, tx)
            .await
            .unwrap();

        let link = Arc::new(StubLink::healthy().with_frames(vec![frame(1), frame(2)]));
        spawn_relay(
            manager.clone(),
            link,
            "http://sim".to_string(),
            outcome.session.session_id.clone(),
            UserId::from("u1"),
            Duration::from_secs(10),
            CancellationToken::new(),
        );

        let first = rx.recv().await.unwrap();
        let SocketCommand::Send(ServerMessage::ExchangeData { frame }) = first else {
            panic!("expected exchange_data, got {first:?}");
        };
        assert_eq!(frame.update_id, 1);

        // After the stub stream ends the session learns the simulator is gone.
        let mut saw_lost = false;
        while let Some(message) = rx.recv().await {
            if matches!(
                &message,
                SocketCommand::Send(ServerMessage::Error { error, .. }) if error.contains("simulator_lost")
            ) {
                saw_lost = true;
                break;
            }
        }
        assert!(saw_lost);
    }

    #[tokio::test]
    async fn unreachable_simulator_is_reported_lost() {
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default(),
            Arc::new(MemoryGateway::new()),
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = manager
            .connect(UserId::from("u1"), DeviceId::from("d1"), None, tx)
            .await
            .unwrap();

        spawn_relay(
            manager.clone(),
            Arc::new(StubLink::unreachable()),
            "http://sim".to_string(),
            outcome.session.session_id.clone(),
            UserId::from("u1"),
            Duration::from_secs(10),
            CancellationToken::new(),
        );

        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message,
            SocketCommand::Send(ServerMessage::Error { .. })
        ));
    }
}
