//! WebSocket endpoint for the per-worker notification stream.
//!
//! A worker connects, sends a `register` action, and from then on receives
//! advisory `task_available` hints. Heartbeats ride the same socket. A
//! dropped connection just detaches the stream — presence decays via the
//! liveness TTL, and the worker re-attaches by reconnecting.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{StreamMessage, WorkerAction};
use crate::api::AppState;
use crate::registry::{WorkerRecord, WorkerRegistration};
use crate::routing::eligible;
use crate::tasks::model::TaskStatus;

/// Build the Axum router for `/ws/worker`.
pub fn worker_stream_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws/worker", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Worker stream client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // The first frame must be a register action; everything else is noise.
    let registration = match await_registration(&mut socket).await {
        Some(registration) => registration,
        None => return,
    };

    let record = match state.registry.register(registration).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "Worker stream registration rejected");
            let reply = serde_json::json!({"type": "error", "error": e.to_string()});
            let _ = socket.send(Message::Text(reply.to_string().into())).await;
            return;
        }
    };

    let worker_id = record.worker_id.clone();
    let (epoch, mut rx) = state.streams.attach(&worker_id).await;
    info!(worker_id = %worker_id, role = %record.role, "Worker stream attached");

    let ack = StreamMessage::Registered {
        worker_id: worker_id.clone(),
    };
    if !send_message(&mut socket, &ack).await {
        state.streams.detach(&worker_id, epoch).await;
        return;
    }

    // Initial sync: hints for work that is claimable right now. Advisory —
    // a worker that connected after these were created still sees them.
    if !send_claimable_hints(&mut socket, &state, &record).await {
        state.streams.detach(&worker_id, epoch).await;
        return;
    }

    loop {
        tokio::select! {
            // Forward fan-out hints to this worker
            hint = rx.recv() => {
                match hint {
                    Some(message) => {
                        if !send_message(&mut socket, &message).await {
                            debug!(worker_id = %worker_id, "Worker stream closed during send");
                            break;
                        }
                    }
                    None => {
                        debug!(worker_id = %worker_id, "Worker stream replaced by a newer connection");
                        break;
                    }
                }
            }

            // Receive actions from the worker
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_worker_frame(&text, &state).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(worker_id = %worker_id, "Worker stream disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(worker_id = %worker_id, error = %e, "Worker stream error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.streams.detach(&worker_id, epoch).await;
}

/// Wait for the opening `register` frame.
async fn await_registration(socket: &mut WebSocket) -> Option<WorkerRegistration> {
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WorkerAction>(&text) {
                Ok(WorkerAction::Register {
                    worker_id,
                    role,
                    owned_codebases,
                    capabilities,
                }) => {
                    return Some(WorkerRegistration {
                        worker_id,
                        role,
                        owned_codebases,
                        capabilities,
                    });
                }
                Ok(other) => {
                    debug!(?other, "Worker frame before registration ignored");
                }
                Err(e) => {
                    debug!(error = %e, text = %text, "Unrecognized worker frame");
                }
            },
            Ok(Message::Ping(data)) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

/// Push hints for every currently-claimable task this worker is eligible
/// for. Returns false when the socket died.
async fn send_claimable_hints(
    socket: &mut WebSocket,
    state: &AppState,
    record: &WorkerRecord,
) -> bool {
    let now = Utc::now();
    for status in [TaskStatus::Pending, TaskStatus::Routed] {
        let tasks = match state.store.list_tasks_by_status(status).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to load claimable tasks for initial sync");
                return true;
            }
        };
        for task in tasks.iter().filter(|t| eligible(t, record, now)) {
            let hint = StreamMessage::TaskAvailable {
                task_id: task.id,
                scope: task.scope.clone(),
            };
            if !send_message(socket, &hint).await {
                return false;
            }
        }
    }
    true
}

async fn send_message(socket: &mut WebSocket, message: &StreamMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize stream message");
            true
        }
    }
}

async fn handle_worker_frame(text: &str, state: &AppState) {
    match serde_json::from_str::<WorkerAction>(text) {
        Ok(WorkerAction::Heartbeat { worker_id }) => {
            if let Err(e) = state.registry.heartbeat(&worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "Heartbeat for unknown worker");
            }
        }
        Ok(WorkerAction::Register {
            worker_id,
            role,
            owned_codebases,
            capabilities,
        }) => {
            // Mid-stream re-registration replaces declarations in place.
            let result = state
                .registry
                .register(WorkerRegistration {
                    worker_id: worker_id.clone(),
                    role,
                    owned_codebases,
                    capabilities,
                })
                .await;
            if let Err(e) = result {
                warn!(worker_id = %worker_id, error = %e, "Re-registration rejected");
            }
        }
        Err(e) => {
            debug!(error = %e, text = %text, "Unrecognized worker WS message");
        }
    }
}
