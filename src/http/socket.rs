//! `/socket` (§6, §4.7, §4.8): the persistent bidirectional front end. Each
//! connection drives a 30 s heartbeat, decodes `{opcode, data}` frames,
//! feeds `code`-bearing frames into the Submission Pipeline, and feeds
//! `id`-only frames into the Reverse-Call Router.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::Submission;
use crate::reverse_call::{CommandDispatch, CommandReply};

use super::{check_auth, AppState};

pub const OPCODE_RECEIVED_DATA: i32 = 4000;
pub const OPCODE_RECONNECT: i32 = 4001;
pub const OPCODE_UNKNOWN_ERROR: i32 = 4002;
pub const OPCODE_INVALID_ORIGIN: i32 = 4003;
pub const OPCODE_DISPATCH: i32 = 4004;
pub const OPCODE_HEARTBEAT: i32 = 4005;
pub const OPCODE_MALFORMED_DATA: i32 = 4006;
pub const OPCODE_UNAUTHORIZED: i32 = 4007;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_MESSAGES: &[&str] = &[
    "still potating",
    "beep boop",
    "hydration check",
    "no thoughts just heartbeats",
];

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub auth: String,
}

/// Shape of an inbound socket frame's `data`: either a new submission
/// (`code`/`msg`) or a reply to an outstanding reverse call (`code`/`msg`/
/// `error`), disambiguated by whether `id` matches a pending reverse call.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    id: Option<String>,
    code: Option<String>,
    #[serde(default)]
    msg: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub async fn handle_upgrade(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !check_auth(&state.config.auth, &params.auth) {
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: OPCODE_UNAUTHORIZED as u16,
                    reason: "unauthorized".into(),
                })))
                .await;
        });
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<CommandDispatch>();
    let client_id = state.reverse_calls.register_client(dispatch_tx).await;

    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let shutdown = CancellationToken::new();

    let heartbeat_tx = out_tx.clone();
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = heartbeat_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if heartbeat_tx
                        .send(Message::Text(heartbeat_frame().into()))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let dispatch_forward_tx = out_tx.clone();
    let dispatch_shutdown = shutdown.clone();
    let dispatch_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = dispatch_shutdown.cancelled() => break,
                next = dispatch_rx.recv() => {
                    let Some(dispatch) = next else { break };
                    let body = json!({"id": dispatch.id, "code": dispatch.code, "msg": dispatch.msg});
                    let frame = encode_frame(OPCODE_DISPATCH, body);
                    if dispatch_forward_tx.send(Message::Text(frame.into())).is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => handle_text(&state, &out_tx, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cancels both tasks promptly instead of waiting on `.abort()`, which
    // only takes effect at the task's next await point.
    shutdown.cancel();
    state.reverse_calls.deregister_client(client_id);
    drop(out_tx);
    let _ = heartbeat_task.await;
    let _ = dispatch_task.await;
    let _ = writer_task.await;
}

async fn handle_text(state: &AppState, outbound: &mpsc::UnboundedSender<Message>, text: &str) {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        send_frame(outbound, OPCODE_MALFORMED_DATA, json!({}));
        return;
    };
    let Some(id) = frame.id.clone() else {
        send_frame(outbound, OPCODE_MALFORMED_DATA, json!({}));
        return;
    };

    let reply = CommandReply {
        id: id.clone(),
        code: frame.code.clone(),
        msg: frame.msg.clone(),
        error: frame.error.clone(),
    };
    if state.reverse_calls.resolve(&id, reply) {
        debug!(id, "resolved a pending reverse call");
        return;
    }

    match frame.code.filter(|c| !c.is_empty()) {
        Some(code) => {
            let submission = Submission {
                code,
                msg: frame.msg,
                correlation_id: Some(id.clone()),
            };
            let response = state.pipeline.submit(submission).await;
            send_frame(
                outbound,
                OPCODE_DISPATCH,
                json!({
                    "id": id,
                    "data": response.data,
                    "statusCode": response.status_code,
                    "duration": response.duration_ms,
                    "errors": response.errors,
                }),
            );
        }
        None => send_frame(outbound, OPCODE_MALFORMED_DATA, json!({"id": id})),
    }
}

fn heartbeat_frame() -> String {
    let message = HEARTBEAT_MESSAGES[rand::rng().random_range(0..HEARTBEAT_MESSAGES.len())];
    let body = json!({"timestamp": now_millis(), "message": message});
    encode_frame(OPCODE_HEARTBEAT, body)
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn encode_frame(opcode: i32, data: Value) -> String {
    json!({"opcode": opcode, "data": data}).to_string()
}

fn send_frame(sender: &mpsc::UnboundedSender<Message>, opcode: i32, data: Value) {
    let _ = sender.send(Message::Text(encode_frame(opcode, data).into()));
}
