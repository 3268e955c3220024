use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::{DeviceId, SessionId, UserId},
    external::AuthClient,
    session::{
        manager::{SessionManager, SocketCommand},
        protocol::{ClientMessage, ServerMessage},
        simulator_ops::{SimulatorOps, StartOutcome},
        stream::{SimulatorLink, spawn_relay},
    },
};

const SOCKET_BUFFER: usize = 32;

/// Shared state of the session pod's WS surface.
#[derive(Clone)]
pub struct SessionServer {
    pub auth: Arc<dyn AuthClient>,
    pub manager: Arc<SessionManager>,
    pub ops: Arc<SimulatorOps>,
    pub link: Arc<dyn SimulatorLink>,
}

pub fn router(server: SessionServer) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/readiness", get(health))
        .with_state(server)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "UP" }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
    #[serde(rename = "deviceId")]
    device_id: String,
}

/// Authenticated WS upgrade: `wss://…/ws?token=…&deviceId=…`.
async fn ws_upgrade(
    State(server): State<SessionServer>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = match server.auth.validate_token(&query.token).await {
        Ok(result) if result.valid => result,
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "success": false,
                    "error": "invalid or expired token",
                    "errorCode": "AUTHENTICATION",
                })),
            )
                .into_response();
        }
    };
    let Some(user_id) = auth.user_id else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "error": "token carries no user",
                "errorCode": "AUTHENTICATION",
            })),
        )
            .into_response();
    };

    let device_id = DeviceId::from(query.device_id.as_str());
    ws.on_upgrade(move |socket| handle_socket(server, socket, user_id, device_id))
}

async fn handle_socket(
    server: SessionServer,
    socket: WebSocket,
    user_id: UserId,
    device_id: DeviceId,
) {
    let (tx, mut rx) = mpsc::channel::<SocketCommand>(SOCKET_BUFFER);

    let outcome = match server
        .manager
        .connect(user_id.clone(), device_id.clone(), None, tx.clone())
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "session connect failed");
            return;
        }
    };
    let session_id = outcome.session.session_id.clone();
    let epoch = outcome.epoch;
    let connection_cancel = CancellationToken::new();

    let (mut sink, mut source) = socket.split();

    // Writer: drains the per-connection command channel onto the wire.
    let writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SocketCommand::Send(message) => {
                    let Ok(text) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketCommand::Close { code } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let _ = tx
        .send(SocketCommand::Send(ServerMessage::Connected {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            pod_name: server.manager.config().pod_name.clone(),
            timestamp: Utc::now().timestamp_millis(),
        }))
        .await;

    // Reader: the per-connection coordinator. One message at a time; a
    // socket silent for the whole session TTL is closed as timed out.
    let idle_limit = server.manager.config().session_ttl;
    loop {
        let message = match tokio::time::timeout(idle_limit, source.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => {
                let _ = tx
                    .send(SocketCommand::Send(ServerMessage::Timeout {
                        message: "Connection timed out due to inactivity".to_string(),
                        timestamp: Utc::now().timestamp_millis(),
                    }))
                    .await;
                let _ = tx.send(SocketCommand::Close { code: 1000 }).await;
                break;
            }
        };
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(user_id = %user_id, error = %err, "socket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let parsed: Result<ClientMessage, _> = serde_json::from_str(text.as_str());
                match parsed {
                    Ok(client_message) => {
                        dispatch(
                            &server,
                            &tx,
                            &user_id,
                            &session_id,
                            &connection_cancel,
                            client_message,
                        )
                        .await;
                    }
                    Err(err) => {
                        let _ = tx
                            .send(SocketCommand::Send(ServerMessage::Error {
                                error: format!("unparseable message: {err}"),
                                error_code: "VALIDATION".to_string(),
                                request_id: None,
                            }))
                            .await;
                    }
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the axum layer.
            _ => {}
        }
    }

    info!(user_id = %user_id, session_id = %session_id, "socket closed");
    connection_cancel.cancel();
    server.manager.disconnect(&user_id, epoch).await;
    writer.abort();
}

async fn dispatch(
    server: &SessionServer,
    tx: &mpsc::Sender<SocketCommand>,
    user_id: &UserId,
    session_id: &SessionId,
    connection_cancel: &CancellationToken,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Heartbeat {
            timestamp,
            latency_ms,
            missed_heartbeats,
            ..
        } => {
            match server
                .manager
                .heartbeat(user_id, latency_ms, missed_heartbeats)
                .await
            {
                Ok((quality, reconnect_recommended)) => {
                    let _ = tx
                        .send(SocketCommand::Send(ServerMessage::HeartbeatAck {
                            timestamp: Utc::now().timestamp_millis(),
                            client_timestamp: timestamp,
                            quality,
                            reconnect_recommended,
                        }))
                        .await;
                }
                Err(err) => {
                    send_error(tx, err.to_string(), "NOT_FOUND").await;
                }
            }
        }
        ClientMessage::SessionInfo | ClientMessage::Reconnect { .. } => {
            if let Some(session) = server.manager.session(user_id).await {
                let _ = tx
                    .send(SocketCommand::Send(ServerMessage::SessionInfo {
                        session_id: session.session_id.to_string(),
                        status: session.status.to_string(),
                        device_id: session.device_id.to_string(),
                        simulator_status: session
                            .metadata
                            .simulator_status
                            .map(|s| s.to_string()),
                        created_at: session.created_at.timestamp_millis(),
                    }))
                    .await;
            } else {
                send_error(tx, format!("no session for {user_id}"), "NOT_FOUND").await;
            }
        }
        ClientMessage::StopSession => {
            if let Err(err) = server.manager.stop_session(user_id).await {
                send_error(tx, err.to_string(), "NOT_FOUND").await;
            }
        }
        ClientMessage::StartSimulator => {
            match server.ops.start_simulator(session_id, user_id).await {
                Ok(StartOutcome::Ready(simulator)) => {
                    spawn_relay(
                        server.manager.clone(),
                        server.link.clone(),
                        simulator.endpoint.clone(),
                        session_id.clone(),
                        user_id.clone(),
                        server.manager.config().heartbeat_interval,
                        connection_cancel.child_token(),
                    );
                    let _ = tx
                        .send(SocketCommand::Send(ServerMessage::SimulatorStatus {
                            status: simulator.status.to_string(),
                            endpoint: Some(simulator.endpoint),
                        }))
                        .await;
                }
                Ok(StartOutcome::InProgress(status)) => {
                    let _ = tx
                        .send(SocketCommand::Send(ServerMessage::SimulatorStatus {
                            status: status.to_string(),
                            endpoint: None,
                        }))
                        .await;
                }
                Err(err) => {
                    send_error(tx, err.to_string(), "UNAVAILABLE").await;
                }
            }
        }
        ClientMessage::StopSimulator => {
            server.ops.stop_simulator(user_id, "stopped by client").await;
            let _ = tx
                .send(SocketCommand::Send(ServerMessage::SimulatorStatus {
                    status: "STOPPED".to_string(),
                    endpoint: None,
                }))
                .await;
        }
    }
}

async fn send_error(tx: &mpsc::Sender<SocketCommand>, error: String, code: &str) {
    let _ = tx
        .send(SocketCommand::Send(ServerMessage::Error {
            error,
            error_code: code.to_string(),
            request_id: None,
        }))
        .await;
}
