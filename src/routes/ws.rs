//! WebSocket handler — the presence session transport.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection ID, registers its outbound channel on
//! the dispatcher, establishes presence, and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Broadcast frames from room peers → forward to client
//!
//! Handler functions validate, call into the presence service, and return an
//! `Outcome`. The dispatch layer owns all reply concerns; room broadcasts
//! are sent by the presence service itself.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → establish presence → send `session:connected`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (items / done / error to sender)
//! 4. Close → presence cleanup runs unconditionally → offline broadcasts

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, FRAME_CODE, FRAME_MESSAGE, Frame, Status};
use crate::registry::ConnId;
use crate::services::membership::Role;
use crate::services::presence;
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide what the sender receives — handlers never send frames directly.
enum Outcome {
    /// Send item frames followed by done+data to the sender only.
    Items { items: Vec<Data>, done: Data },
    /// Send done+data to the sender only.
    Reply(Data),
    /// Send an empty done to the sender.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // The principal is authenticated by the layer fronting this service; the
    // upgrade only refuses a missing identity.
    let Some(user_id) = params.get("user").filter(|u| !u.is_empty()).cloned() else {
        return (StatusCode::UNAUTHORIZED, "user identity required").into_response();
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: String) {
    let conn_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);
    state.dispatcher.register(conn_id, client_tx).await;

    // Presence cannot be established without the user's room list; a store
    // failure here is fatal to connection setup.
    let rooms = match presence::connect(&state, &user_id, conn_id).await {
        Ok(rooms) => rooms,
        Err(e) => {
            warn!(%conn_id, user_id, error = %e, "ws: presence setup failed");
            let err = Frame::request("session:error", Data::new())
                .with_data(FRAME_CODE, e.error_code())
                .with_data(FRAME_MESSAGE, e.to_string());
            let _ = send_frame(&mut socket, &err).await;
            state.dispatcher.unregister(conn_id).await;
            return;
        }
    };

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("conn_id", conn_id.to_string())
        .with_data("user_id", user_id.clone())
        .with_data("room_ids", serde_json::json!(rooms));
    if send_frame(&mut socket, &welcome).await.is_err() {
        presence::disconnect(&state, &user_id, conn_id).await;
        return;
    }

    info!(%conn_id, user_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        dispatch_frame(&state, &mut socket, &user_id, conn_id, &text).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup is independent of the socket's liveness: it always runs and
    // broadcasts offline for every room this connection held alone.
    presence::disconnect(&state, &user_id, conn_id).await;
    info!(%conn_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse an incoming JSON frame, dispatch to handler, apply outcome.
async fn dispatch_frame(state: &AppState, socket: &mut WebSocket, user_id: &str, conn_id: ConnId, text: &str) {
    let sender_frames = process_inbound_text(state, user_id, conn_id, text).await;
    for frame in sender_frames {
        let _ = send_frame(socket, &frame).await;
    }
}

/// Parse and process one inbound text frame and return frames for the sender.
///
/// This keeps the websocket transport concerns separate from frame handling,
/// so tests can exercise command dispatch and presence behavior end-to-end.
async fn process_inbound_text(state: &AppState, user_id: &str, conn_id: ConnId, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%conn_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("session:error", Data::new())
                .with_data(FRAME_MESSAGE, format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated identity as `from`.
    req.from = Some(user_id.to_string());
    info!(%conn_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "room" => handle_room(state, user_id, conn_id, &req).await,
        "role" => handle_role(state, user_id, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Items { items, done }) => {
            let mut frames: Vec<Frame> = items.into_iter().map(|data| req.item(data)).collect();
            frames.push(req.done_with(done));
            frames
        }
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(state: &AppState, user_id: &str, conn_id: ConnId, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    let Some(room_id) = req
        .room_id
        .or_else(|| req.data.get("room_id").and_then(serde_json::Value::as_i64))
    else {
        return Err(req.error("room_id required"));
    };
    let old_room = req.data.get("old_room_id").and_then(serde_json::Value::as_i64);

    match op {
        "join" => match presence::join_room(state, user_id, conn_id, room_id, old_room).await {
            Ok(()) => {
                let mut data = Data::new();
                data.insert("room_id".into(), serde_json::json!(room_id));
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "rejoin" => match presence::rejoin_room(state, user_id, conn_id, room_id, old_room).await {
            Ok(users) => {
                // Joined ack first, then the online snapshot, per protocol order.
                let mut joined = Data::new();
                joined.insert("room_id".into(), serde_json::json!(room_id));
                let mut online = Data::new();
                online.insert("users".into(), serde_json::json!(users));
                Ok(Outcome::Items { items: vec![joined, online], done: Data::new() })
            }
            Err(e) => Err(req.error_from(&e)),
        },
        _ => Err(req.error(format!("unknown room op: {op}"))),
    }
}

// =============================================================================
// ROLE HANDLER
// =============================================================================

async fn handle_role(state: &AppState, user_id: &str, req: &Frame) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "change" => {
            let Some(room_id) = req
                .room_id
                .or_else(|| req.data.get("room_id").and_then(serde_json::Value::as_i64))
            else {
                return Err(req.error("room_id required"));
            };
            let Some(role) = req
                .data
                .get("role")
                .cloned()
                .and_then(|v| serde_json::from_value::<Role>(v).ok())
            else {
                return Err(req.error("role required"));
            };

            presence::change_role(state, room_id, user_id, role).await;
            Ok(Outcome::Done)
        }
        _ => Err(req.error(format!("unknown role op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get(FRAME_MESSAGE).and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
