//! Room presence queries.

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::registry::RoomId;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub room_id: RoomId,
    pub users: Vec<String>,
}

/// `GET /api/rooms/:id/online` — users currently online in a room.
/// Unknown rooms yield an empty list, not an error.
pub async fn online_users(State(state): State<AppState>, Path(room_id): Path<RoomId>) -> Json<OnlineUsersResponse> {
    let users = state.registry.online_users(room_id);
    Json(OnlineUsersResponse { room_id, users })
}
