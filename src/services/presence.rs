//! Presence session — the per-connection lifecycle protocol.
//!
//! DESIGN
//! ======
//! One function per lifecycle event: connect, room switch (with optional
//! online-snapshot refresh), disconnect, and role-change fan-out. Each
//! orchestrates the membership store (authorization), the registry
//! (bookkeeping), and the dispatcher (notifications); none of them touch the
//! socket directly.
//!
//! ERROR HANDLING
//! ==============
//! The membership lookup runs before any mutation, so a store failure on
//! connect leaves no partial registry state. The only recoverable failure is
//! `Unauthorized` on a room switch, which aborts with zero state change.
//! Disconnect cleanup is total: it cannot fail and always runs to
//! completion, whether or not the peer socket is still alive.

use tracing::info;

use crate::frame::{Data, ErrorCode, Frame};
use crate::registry::{ConnId, RoomId, UserId};
use crate::services::membership::{MembershipError, Role};
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("not a member of room {0}")]
    Unauthorized(RoomId),
    #[error("membership lookup failed: {0}")]
    Membership(#[from] MembershipError),
}

impl ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "E_UNAUTHORIZED",
            Self::Membership(_) => "E_MEMBERSHIP",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Membership(_))
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Establish presence for a fresh connection: subscribe it to every room the
/// user belongs to and announce the user online in each. Returns the room
/// list the connection was subscribed to.
///
/// # Errors
///
/// Returns a membership error if the store is unreachable; this is fatal to
/// connection setup and happens before any registry mutation.
pub async fn connect(state: &AppState, user_id: &str, conn_id: ConnId) -> Result<Vec<RoomId>, PresenceError> {
    let rooms = state.membership.list_user_rooms(user_id).await?;

    for &room_id in &rooms {
        state.dispatcher.subscribe(conn_id, room_id).await;
        state.registry.add(user_id, room_id, conn_id);
        let status = user_status(room_id, user_id, true);
        state.dispatcher.send_to_room(room_id, &status).await;
    }

    info!(%conn_id, user_id, rooms = rooms.len(), "presence established");
    Ok(rooms)
}

/// Switch the connection's active room. The membership check runs first; an
/// unauthorized switch mutates nothing. The switch itself is silent to both
/// rooms — only the caller learns about it, via the command reply.
///
/// # Errors
///
/// `Unauthorized` if the user does not belong to `new_room`; a membership
/// error if the store is unreachable.
pub async fn join_room(
    state: &AppState,
    user_id: &str,
    conn_id: ConnId,
    new_room: RoomId,
    old_room: Option<RoomId>,
) -> Result<(), PresenceError> {
    if !state.membership.is_member(user_id, new_room).await? {
        return Err(PresenceError::Unauthorized(new_room));
    }

    if let Some(old_room) = old_room {
        state.dispatcher.unsubscribe(conn_id, old_room).await;
        state.registry.remove(user_id, old_room, conn_id);
    }
    state.dispatcher.subscribe(conn_id, new_room).await;
    state.registry.add(user_id, new_room, conn_id);

    info!(%conn_id, user_id, %new_room, old_room = ?old_room, "room switched");
    Ok(())
}

/// `join_room`, then a point-in-time snapshot of who is online in the new
/// room, for the caller only.
///
/// # Errors
///
/// Same as [`join_room`]; on failure no snapshot is taken.
pub async fn rejoin_room(
    state: &AppState,
    user_id: &str,
    conn_id: ConnId,
    new_room: RoomId,
    old_room: Option<RoomId>,
) -> Result<Vec<UserId>, PresenceError> {
    join_room(state, user_id, conn_id, new_room, old_room).await?;
    Ok(state.registry.online_users(new_room))
}

/// Tear down a connection's presence: withdraw every contribution, drop the
/// dispatcher registration, and announce the user offline in each room where
/// this was the last contributing connection. Never fails.
pub async fn disconnect(state: &AppState, user_id: &str, conn_id: ConnId) {
    let affected = state.registry.remove_connection(user_id, conn_id);
    state.dispatcher.unregister(conn_id).await;

    for &room_id in &affected {
        let status = user_status(room_id, user_id, false);
        state.dispatcher.send_to_room(room_id, &status).await;
    }

    info!(%conn_id, user_id, rooms = affected.len(), "presence cleared");
}

/// Announce a role change to a room's current subscribers. Authorization is
/// the caller's layer's concern; no registry mutation happens here.
pub async fn change_role(state: &AppState, room_id: RoomId, user_id: &str, role: Role) {
    let mut data = Data::new();
    data.insert("room_id".into(), serde_json::json!(room_id));
    data.insert("user_id".into(), serde_json::json!(user_id));
    data.insert("role".into(), serde_json::json!(role));
    let frame = Frame::request("role:changed", data).with_room_id(room_id);

    state.dispatcher.send_to_room(room_id, &frame).await;
    info!(%room_id, user_id, ?role, "role change broadcast");
}

// =============================================================================
// HELPERS
// =============================================================================

/// Presence push: `user_id` went online/offline in `room_id`.
fn user_status(room_id: RoomId, user_id: &str, online: bool) -> Frame {
    let mut data = Data::new();
    data.insert("user_id".into(), serde_json::json!(user_id));
    data.insert("online".into(), serde_json::json!(online));
    Frame::request("presence:status", data).with_room_id(room_id)
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
