use super::*;
use crate::state::test_helpers;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

/// Register a connection subscribed to one room, returning its receiver as
/// the observation point for that room's broadcasts.
async fn observer(state: &crate::state::AppState, room: RoomId) -> mpsc::Receiver<Frame> {
    let conn = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(32);
    state.dispatcher.register(conn, tx).await;
    state.dispatcher.subscribe(conn, room).await;
    rx
}

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

fn assert_status(frame: &Frame, room: RoomId, user: &str, online: bool) {
    assert_eq!(frame.syscall, "presence:status");
    assert_eq!(frame.room_id, Some(room));
    assert_eq!(frame.data.get("user_id").and_then(|v| v.as_str()), Some(user));
    assert_eq!(frame.data.get("online").and_then(serde_json::Value::as_bool), Some(online));
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn connect_registers_and_announces_per_room() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101), ("alice", 102)]);
    let mut room_101 = observer(&state, 101).await;
    let mut room_102 = observer(&state, 102).await;

    let conn = Uuid::new_v4();
    let rooms = connect(&state, "alice", conn).await.expect("connect should succeed");

    assert_eq!(rooms, vec![101, 102]);
    assert_eq!(state.registry.online_users(101), vec!["alice".to_string()]);
    assert_eq!(state.registry.online_users(102), vec!["alice".to_string()]);

    assert_status(&recv_frame(&mut room_101).await, 101, "alice", true);
    assert_status(&recv_frame(&mut room_102).await, 102, "alice", true);
}

#[tokio::test]
async fn connect_includes_the_joining_connection_in_the_announcement() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101)]);

    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    state.dispatcher.register(conn, tx).await;

    connect(&state, "alice", conn).await.expect("connect should succeed");

    // The just-joined connection harmlessly receives its own status.
    assert_status(&recv_frame(&mut rx).await, 101, "alice", true);
}

#[tokio::test]
async fn connect_with_no_rooms_is_quiet() {
    let state = test_helpers::test_app_state();

    let rooms = connect(&state, "alice", Uuid::new_v4()).await.expect("connect should succeed");

    assert!(rooms.is_empty());
    assert!(state.registry.rooms_of("alice").is_empty());
}

#[tokio::test]
async fn connect_store_failure_is_fatal_with_no_partial_state() {
    let state = test_helpers::test_app_state_unavailable();
    let mut room_101 = observer(&state, 101).await;

    let err = connect(&state, "alice", Uuid::new_v4()).await.expect_err("connect should fail");

    assert!(matches!(err, PresenceError::Membership(_)));
    assert_eq!(err.error_code(), "E_MEMBERSHIP");
    assert!(state.registry.rooms_of("alice").is_empty());
    assert_no_frame(&mut room_101).await;
}

// =============================================================================
// Room switch
// =============================================================================

#[tokio::test]
async fn join_room_moves_presence_silently() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101), ("alice", 102)]);

    let conn = Uuid::new_v4();
    connect(&state, "alice", conn).await.expect("connect should succeed");

    // Observers attach after connect so the switch is the only traffic.
    let mut room_101 = observer(&state, 101).await;
    let mut room_102 = observer(&state, 102).await;

    join_room(&state, "alice", conn, 102, Some(101)).await.expect("join should succeed");

    assert!(state.registry.online_users(101).is_empty());
    assert_eq!(state.registry.online_users(102), vec!["alice".to_string()]);

    // The switch itself is not broadcast to either room.
    assert_no_frame(&mut room_101).await;
    assert_no_frame(&mut room_102).await;
}

#[tokio::test]
async fn join_room_without_old_room_only_adds() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 102)]);

    let conn = Uuid::new_v4();
    join_room(&state, "alice", conn, 102, None).await.expect("join should succeed");

    assert_eq!(state.registry.online_users(102), vec!["alice".to_string()]);
}

#[tokio::test]
async fn unauthorized_join_mutates_nothing() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101)]);

    let conn = Uuid::new_v4();
    connect(&state, "alice", conn).await.expect("connect should succeed");

    let err = join_room(&state, "alice", conn, 999, Some(101)).await.expect_err("join should fail");

    assert!(matches!(err, PresenceError::Unauthorized(999)));
    assert_eq!(err.error_code(), "E_UNAUTHORIZED");
    // Still online in 101, never online in 999.
    assert_eq!(state.registry.online_users(101), vec!["alice".to_string()]);
    assert!(state.registry.online_users(999).is_empty());
    assert_eq!(state.registry.rooms_of("alice"), vec![101]);
}

#[tokio::test]
async fn switch_on_one_device_keeps_presence_held_by_another() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101), ("alice", 102)]);

    let phone = Uuid::new_v4();
    let laptop = Uuid::new_v4();
    connect(&state, "alice", phone).await.expect("connect should succeed");
    connect(&state, "alice", laptop).await.expect("connect should succeed");

    join_room(&state, "alice", phone, 102, Some(101)).await.expect("join should succeed");

    // The laptop still contributes presence in 101.
    assert_eq!(state.registry.online_users(101), vec!["alice".to_string()]);
    assert_eq!(state.registry.online_users(102), vec!["alice".to_string()]);
}

#[tokio::test]
async fn rejoin_returns_online_snapshot_of_new_room() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 102), ("bob", 102)]);

    let bob_conn = Uuid::new_v4();
    connect(&state, "bob", bob_conn).await.expect("connect should succeed");

    let conn = Uuid::new_v4();
    let online = rejoin_room(&state, "alice", conn, 102, None).await.expect("rejoin should succeed");

    assert_eq!(online, vec!["alice".to_string(), "bob".to_string()]);
}

#[tokio::test]
async fn rejoin_into_empty_room_returns_only_self() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 102)]);

    let online = rejoin_room(&state, "alice", Uuid::new_v4(), 102, None)
        .await
        .expect("rejoin should succeed");

    assert_eq!(online, vec!["alice".to_string()]);
}

#[tokio::test]
async fn unauthorized_rejoin_takes_no_snapshot() {
    let state = test_helpers::test_app_state_with_members(&[("bob", 102)]);

    let err = rejoin_room(&state, "alice", Uuid::new_v4(), 102, None)
        .await
        .expect_err("rejoin should fail");

    assert!(matches!(err, PresenceError::Unauthorized(102)));
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_announces_offline_per_affected_room() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101), ("alice", 102)]);

    let conn = Uuid::new_v4();
    connect(&state, "alice", conn).await.expect("connect should succeed");

    let mut room_101 = observer(&state, 101).await;
    let mut room_102 = observer(&state, 102).await;

    disconnect(&state, "alice", conn).await;

    assert!(state.registry.online_users(101).is_empty());
    assert!(state.registry.online_users(102).is_empty());
    assert_status(&recv_frame(&mut room_101).await, 101, "alice", false);
    assert_status(&recv_frame(&mut room_102).await, 102, "alice", false);
    assert_no_frame(&mut room_101).await;
    assert_no_frame(&mut room_102).await;
}

#[tokio::test]
async fn disconnect_with_second_device_stays_online_and_silent() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101)]);

    let phone = Uuid::new_v4();
    let laptop = Uuid::new_v4();
    connect(&state, "alice", phone).await.expect("connect should succeed");
    connect(&state, "alice", laptop).await.expect("connect should succeed");

    let mut room_101 = observer(&state, 101).await;
    disconnect(&state, "alice", phone).await;

    // The laptop still holds presence; nobody is told anything.
    assert_eq!(state.registry.online_users(101), vec!["alice".to_string()]);
    assert_no_frame(&mut room_101).await;
}

#[tokio::test]
async fn disconnect_of_unknown_connection_is_total() {
    let state = test_helpers::test_app_state();
    disconnect(&state, "ghost", Uuid::new_v4()).await;
    assert!(state.registry.rooms_of("ghost").is_empty());
}

// =============================================================================
// Role change
// =============================================================================

#[tokio::test]
async fn change_role_broadcasts_to_room_subscribers() {
    let state = test_helpers::test_app_state_with_members(&[("alice", 101), ("bob", 101)]);
    let mut room_101 = observer(&state, 101).await;
    let mut room_102 = observer(&state, 102).await;

    change_role(&state, 101, "alice", Role::Owner).await;

    let frame = recv_frame(&mut room_101).await;
    assert_eq!(frame.syscall, "role:changed");
    assert_eq!(frame.room_id, Some(101));
    assert_eq!(frame.data.get("user_id").and_then(|v| v.as_str()), Some("alice"));
    assert_eq!(frame.data.get("role").and_then(|v| v.as_str()), Some("owner"));

    assert_no_frame(&mut room_102).await;
    // No registry mutation.
    assert!(state.registry.online_users(101).is_empty());
}
