//! In-memory presence registry — who is online in which room.
//!
//! DESIGN
//! ======
//! Bidirectional index: a forward map `user -> room -> connections` and an
//! inverse map `room -> users`, both behind one mutex so no caller can
//! observe the pair present in one map but not the other. A user counts as
//! online in a room while at least one of their connections contributes the
//! pair; the contribution sets make room switches on one device safe for
//! presence held by another device of the same user.
//!
//! Operations never suspend. Callers hold the lock only for map updates,
//! never across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

/// Opaque identifier of an authenticated principal, supplied by the
/// authentication layer in front of this service.
pub type UserId = String;

/// Numeric room identifier.
pub type RoomId = i64;

/// One live websocket connection.
pub type ConnId = Uuid;

// =============================================================================
// REGISTRY
// =============================================================================

/// Process-wide presence index. Owned by `AppState`, injected into sessions.
pub struct PresenceRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    /// user -> room -> connections contributing the pair.
    forward: HashMap<UserId, HashMap<RoomId, HashSet<ConnId>>>,
    /// room -> users currently online in it.
    inverse: HashMap<RoomId, HashSet<UserId>>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(RegistryInner::default()) }
    }

    /// Record `conn`'s contribution to the user's presence in a room.
    /// Idempotent; always succeeds.
    pub fn add(&self, user: &str, room: RoomId, conn: ConnId) {
        let mut inner = self.lock();
        inner
            .forward
            .entry(user.to_string())
            .or_default()
            .entry(room)
            .or_default()
            .insert(conn);
        inner.inverse.entry(room).or_default().insert(user.to_string());
    }

    /// Drop `conn`'s contribution to the user's presence in a room. The pair
    /// leaves both maps when the last contributing connection is removed.
    /// No-op for absent contributions.
    pub fn remove(&self, user: &str, room: RoomId, conn: ConnId) {
        let mut inner = self.lock();
        inner.remove_contribution(user, room, conn);
    }

    /// Point-in-time snapshot of the users online in a room. Empty for
    /// unknown rooms.
    #[must_use]
    pub fn online_users(&self, room: RoomId) -> Vec<UserId> {
        let inner = self.lock();
        let Some(users) = inner.inverse.get(&room) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = users.iter().cloned().collect();
        users.sort_unstable();
        users
    }

    /// Point-in-time snapshot of the rooms a user is online in.
    #[must_use]
    pub fn rooms_of(&self, user: &str) -> Vec<RoomId> {
        let inner = self.lock();
        let Some(rooms) = inner.forward.get(user) else {
            return Vec::new();
        };
        let mut rooms: Vec<RoomId> = rooms.keys().copied().collect();
        rooms.sort_unstable();
        rooms
    }

    /// Atomically remove every contribution of `conn` and return the rooms
    /// where the user thereby went offline, so the caller can broadcast
    /// "offline" exactly once per affected room. Rooms where another
    /// connection of the same user remains are not returned.
    pub fn remove_connection(&self, user: &str, conn: ConnId) -> Vec<RoomId> {
        let mut inner = self.lock();
        let rooms: Vec<RoomId> = inner
            .forward
            .get(user)
            .map(|rooms| {
                rooms
                    .iter()
                    .filter(|(_, conns)| conns.contains(&conn))
                    .map(|(room, _)| *room)
                    .collect()
            })
            .unwrap_or_default();

        let mut affected = Vec::new();
        for room in rooms {
            if inner.remove_contribution(user, room, conn) {
                affected.push(room);
            }
        }
        affected.sort_unstable();
        affected
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryInner {
    /// Returns true when the removal took the user offline in the room.
    fn remove_contribution(&mut self, user: &str, room: RoomId, conn: ConnId) -> bool {
        let Some(rooms) = self.forward.get_mut(user) else {
            return false;
        };
        let Some(conns) = rooms.get_mut(&room) else {
            return false;
        };
        conns.remove(&conn);
        if !conns.is_empty() {
            return false;
        }

        // Last contribution gone: drop the pair from both maps.
        rooms.remove(&room);
        if rooms.is_empty() {
            self.forward.remove(user);
        }
        if let Some(users) = self.inverse.get_mut(&room) {
            users.remove(user);
            if users.is_empty() {
                self.inverse.remove(&room);
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
