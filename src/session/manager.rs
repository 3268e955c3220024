use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    domain::{
        DeviceId, UserId,
        session::{ConnectionQuality, Session, SessionStatus},
    },
    error::{SessionError, SimdeskResult},
    session::{
        protocol::{CLOSE_CONNECTION_REPLACED, ServerMessage},
        simulator_ops::SimulatorOps,
    },
    storage::DatabaseGateway,
};

/// Commands consumed by a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Send(ServerMessage),
    Close { code: u16 },
}

pub type SocketSender = mpsc::Sender<SocketCommand>;

struct SessionEntry {
    session: Session,
    socket: Option<SocketSender>,
    /// Bumped on every socket attach; stale disconnects and grace timers
    /// carry the epoch they were armed with and no-op on mismatch.
    epoch: u64,
}

/// Result of an authenticated WS upgrade.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub session: Session,
    pub epoch: u64,
    /// Whether an older socket was displaced by this connection.
    pub replaced_previous: bool,
}

/// Owns every session binding of this pod and enforces the single
/// active-(user, device) invariant.
pub struct SessionManager {
    cfg: SessionConfig,
    gateway: Arc<dyn DatabaseGateway>,
    simulator_ops: Option<Arc<SimulatorOps>>,
    inner: Mutex<HashMap<UserId, SessionEntry>>,
}

impl SessionManager {
    pub fn new(cfg: SessionConfig, gateway: Arc<dyn DatabaseGateway>) -> Self {
        Self {
            cfg,
            gateway,
            simulator_ops: None,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_simulator_ops(mut self, ops: Arc<SimulatorOps>) -> Self {
        self.simulator_ops = Some(ops);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    /// Installs or re-attaches the binding for an authenticated upgrade.
    ///
    /// A connection from a different device displaces the old socket with
    /// `connection_replaced` and close code 4000; the simulator is retained
    /// and only the socket is swapped.
    pub async fn connect(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        ip_address: Option<String>,
        socket: SocketSender,
    ) -> SimdeskResult<ConnectOutcome> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.cfg.session_ttl).unwrap_or_default();
        let mut inner = self.inner.lock().await;

        let (outcome, session) = if !inner.contains_key(&user_id) {
            let mut session = Session::open(
                user_id.clone(),
                device_id.clone(),
                self.cfg.pod_name.clone(),
                ttl,
                now,
            );
            session.metadata.ip_address = ip_address;
            info!(user_id = %user_id, device_id = %device_id, session_id = %session.session_id, "session opened");
            inner.insert(
                user_id.clone(),
                SessionEntry {
                    session: session.clone(),
                    socket: Some(socket),
                    epoch: 1,
                },
            );
            (
                ConnectOutcome {
                    session: session.clone(),
                    epoch: 1,
                    replaced_previous: false,
                },
                session,
            )
        } else {
            let entry = inner.get_mut(&user_id).expect("presence checked above");
            let replaced = if entry.session.device_id == device_id {
                debug!(user_id = %user_id, "same-device reconnection");
                entry.session.details.reconnect_count += 1;
                entry.session.metadata.reconnect_count =
                    Some(entry.session.details.reconnect_count);
                self.displace_socket(entry, &device_id, "reconnected from the same device")
                    .await
            } else {
                info!(
                    user_id = %user_id,
                    old_device = %entry.session.device_id,
                    new_device = %device_id,
                    "device replacement"
                );
                let replaced = self
                    .displace_socket(entry, &device_id, "replaced by a new device")
                    .await;
                entry.session.device_id = device_id.clone();
                entry.session.metadata.device_id = Some(device_id.clone());
                replaced
            };

            entry.session.status = SessionStatus::Active;
            entry.session.metadata.ip_address = ip_address;
            entry.session.touch(ttl, now);
            entry.socket = Some(socket);
            entry.epoch += 1;
            (
                ConnectOutcome {
                    session: entry.session.clone(),
                    epoch: entry.epoch,
                    replaced_previous: replaced,
                },
                entry.session.clone(),
            )
        };
        drop(inner);

        if let Err(err) = self.gateway.upsert_session(&session).await {
            self.fail_session(&user_id, "session store write failed").await;
            return Err(err);
        }
        Ok(outcome)
    }

    async fn displace_socket(
        &self,
        entry: &mut SessionEntry,
        new_device: &DeviceId,
        reason: &str,
    ) -> bool {
        let Some(old_socket) = entry.socket.take() else {
            return false;
        };
        let _ = old_socket
            .send(SocketCommand::Send(ServerMessage::ConnectionReplaced {
                message: format!("Your connection has been {reason}"),
                new_device_info: Some(json!({ "deviceId": new_device.to_string() })),
                timestamp: Utc::now().timestamp_millis(),
            }))
            .await;
        let _ = old_socket
            .send(SocketCommand::Close {
                code: CLOSE_CONNECTION_REPLACED,
            })
            .await;
        true
    }

    /// Marks the session RECONNECTING and arms the grace timer.
    ///
    /// Called from the reader loop when the socket closes; a stale epoch
    /// means a newer connection already took over.
    pub async fn disconnect(self: &Arc<Self>, user_id: &UserId, epoch: u64) {
        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(user_id) else {
                return;
            };
            if entry.epoch != epoch || !entry.session.status.is_live() {
                return;
            }
            entry.socket = None;
            entry.session.status = SessionStatus::Reconnecting;
            entry.session.last_active = Utc::now();
            info!(user_id = %user_id, "socket closed, reconnect grace started");
            let _ = self.gateway.upsert_session(&entry.session).await;
        }

        let manager = Arc::clone(self);
        let user_id = user_id.clone();
        let grace = self.cfg.reconnect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.expire_if_still_reconnecting(&user_id, epoch).await;
        });
    }

    /// Missed grace runs the session down in two persisted steps:
    /// RECONNECTING → INACTIVE → EXPIRED.
    async fn expire_if_still_reconnecting(&self, user_id: &UserId, epoch: u64) {
        let inactive = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(user_id) else {
                return;
            };
            if entry.epoch != epoch || entry.session.status != SessionStatus::Reconnecting {
                return;
            }
            entry.session.status = SessionStatus::Inactive;
            entry.session.metadata.termination_reason =
                Some("reconnect grace expired".to_string());
            entry.session.clone()
        };
        let _ = self.gateway.upsert_session(&inactive).await;

        let expired = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(user_id) else {
                return;
            };
            // A reconnect may have slipped in between the two steps.
            if entry.epoch != epoch || entry.session.status != SessionStatus::Inactive {
                return;
            }
            entry.session.status = SessionStatus::Expired;
            let session = entry.session.clone();
            inner.remove(user_id);
            session
        };

        warn!(user_id = %user_id, session_id = %expired.session_id, "reconnect grace expired, session destroyed");
        let _ = self.gateway.upsert_session(&expired).await;
        if let Some(ops) = &self.simulator_ops {
            ops.stop_simulator(user_id, "session expired").await;
        }
    }

    /// Applies a client heartbeat report and returns the derived quality.
    pub async fn heartbeat(
        &self,
        user_id: &UserId,
        latency_ms: i64,
        missed_heartbeats: u32,
    ) -> SimdeskResult<(ConnectionQuality, bool)> {
        let ttl = ChronoDuration::from_std(self.cfg.session_ttl).unwrap_or_default();
        let (quality, recommend, session) = {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .get_mut(user_id)
                .ok_or_else(|| SessionError::NotFound(user_id.to_string()))?;
            let (quality, recommend) =
                ConnectionQuality::classify(latency_ms, missed_heartbeats);
            entry.session.details.latency_ms = latency_ms;
            entry.session.details.missed_heartbeats = missed_heartbeats;
            entry.session.details.quality = quality;
            entry.session.metadata.connection_quality = Some(quality);
            entry.session.metadata.heartbeat_latency = Some(latency_ms);
            entry.session.metadata.missed_heartbeats = Some(missed_heartbeats);
            entry.session.touch(ttl, Utc::now());
            (quality, recommend, entry.session.clone())
        };
        if let Err(err) = self.gateway.upsert_session(&session).await {
            self.fail_session(user_id, "session store write failed").await;
            return Err(err);
        }
        Ok((quality, recommend))
    }

    pub async fn session(&self, user_id: &UserId) -> Option<Session> {
        self.inner
            .lock()
            .await
            .get(user_id)
            .map(|e| e.session.clone())
    }

    /// Explicit stop: tears the binding down immediately.
    pub async fn stop_session(&self, user_id: &UserId) -> SimdeskResult<()> {
        let (session, socket) = {
            let mut inner = self.inner.lock().await;
            let Some(mut entry) = inner.remove(user_id) else {
                return Err(SessionError::NotFound(user_id.to_string()).into());
            };
            entry.session.status = SessionStatus::Inactive;
            entry.session.metadata.termination_reason = Some("stopped by client".to_string());
            (entry.session, entry.socket.take())
        };

        if let Some(socket) = socket {
            let _ = socket
                .send(SocketCommand::Send(ServerMessage::Shutdown {
                    message: "Session stopped".to_string(),
                    timestamp: Utc::now().timestamp_millis(),
                }))
                .await;
            let _ = socket.send(SocketCommand::Close { code: 1000 }).await;
        }
        self.gateway.upsert_session(&session).await?;
        if let Some(ops) = &self.simulator_ops {
            ops.stop_simulator(user_id, "session stopped").await;
        }
        Ok(())
    }

    /// Internal fatal: the session can no longer be maintained reliably.
    ///
    /// The binding moves to ERROR, the client is told, and recovery requires
    /// a fresh connect.
    async fn fail_session(&self, user_id: &UserId, reason: &str) {
        let (session, socket) = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.get_mut(user_id) else {
                return;
            };
            entry.session.status = SessionStatus::Error;
            entry.session.metadata.termination_reason = Some(reason.to_string());
            (entry.session.clone(), entry.socket.clone())
        };

        warn!(user_id = %user_id, reason, "session entered ERROR state");
        if let Some(socket) = socket {
            let _ = socket
                .send(SocketCommand::Send(ServerMessage::Error {
                    error: format!("session failed: {reason}"),
                    error_code: "INTERNAL".to_string(),
                    request_id: None,
                }))
                .await;
        }
        if let Err(err) = self.gateway.upsert_session(&session).await {
            warn!(user_id = %user_id, error = %err, "could not persist ERROR session state");
        }
    }

    /// Records the loss of the simulator stream; the next client frame
    /// carries a `simulator_lost` error.
    ///
    /// The session itself stays live: the client recovers by re-issuing
    /// `start_simulator`. Session-level ERROR is reserved for
    /// [`Self::fail_session`].
    pub async fn mark_simulator_lost(&self, user_id: &UserId) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.get_mut(user_id) else {
            return;
        };
        entry.session.metadata.simulator_status = None;
        entry.session.metadata.simulator_endpoint = None;
        entry.session.metadata.termination_reason = Some("simulator lost".to_string());
        if let Some(socket) = &entry.socket {
            let _ = socket
                .send(SocketCommand::Send(ServerMessage::Error {
                    error: "simulator_lost: simulator stopped responding, re-issue start_simulator"
                        .to_string(),
                    error_code: "UNAVAILABLE".to_string(),
                    request_id: None,
                }))
                .await;
        }
    }

    /// Pushes a message to the user's live socket, if any.
    pub async fn push(&self, user_id: &UserId, message: ServerMessage) -> bool {
        let inner = self.inner.lock().await;
        if let Some(SessionEntry {
            socket: Some(socket),
            ..
        }) = inner.get(user_id)
        {
            return socket.send(SocketCommand::Send(message)).await.is_ok();
        }
        false
    }

    /// Number of live sessions in this process (at most one per user).
    pub async fn live_sessions(&self) -> usize {
        self.inner
            .lock()
            .await
            .values()
            .filter(|e| e.session.status.is_live())
            .count()
    }
}
