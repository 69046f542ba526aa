//! Broadcast dispatcher — outbound event fan-out.
//!
//! DESIGN
//! ======
//! The dispatcher is the capability boundary between presence logic and the
//! transport: "send this frame to every connection subscribed to room R" and
//! "send this frame to one connection". The websocket layer registers each
//! connection's mpsc sender at upgrade; subscriptions are plain sets on top
//! of that table.
//!
//! Delivery is at-most-once, best-effort: a full client channel is skipped,
//! never awaited. Sends to the same room from the same session keep call
//! order because fan-out walks the subscriber set synchronously per call.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::frame::Frame;
use crate::registry::{ConnId, RoomId};

// =============================================================================
// CAPABILITY TRAIT
// =============================================================================

/// Outbound notification sink, abstracted so presence logic never depends on
/// a concrete transport.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Attach a connection's outbound channel.
    async fn register(&self, conn: ConnId, tx: mpsc::Sender<Frame>);

    /// Detach a connection and drop all of its subscriptions.
    async fn unregister(&self, conn: ConnId);

    /// Subscribe a connection to a room's broadcasts.
    async fn subscribe(&self, conn: ConnId, room: RoomId);

    /// Unsubscribe a connection from a room's broadcasts.
    async fn unsubscribe(&self, conn: ConnId, room: RoomId);

    /// Fan a frame out to every connection currently subscribed to the room.
    async fn send_to_room(&self, room: RoomId, frame: &Frame);

    /// Deliver a frame to one connection.
    async fn send_to_connection(&self, conn: ConnId, frame: &Frame);
}

// =============================================================================
// CHANNEL-BACKED IMPLEMENTATION
// =============================================================================

/// Production dispatcher: per-connection mpsc senders plus room subscription
/// sets. The websocket loop drains each connection's receiver into its
/// socket.
pub struct ChannelDispatcher {
    inner: RwLock<DispatchInner>,
}

#[derive(Default)]
struct DispatchInner {
    connections: HashMap<ConnId, mpsc::Sender<Frame>>,
    rooms: HashMap<RoomId, HashSet<ConnId>>,
}

impl ChannelDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(DispatchInner::default()) }
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn register(&self, conn: ConnId, tx: mpsc::Sender<Frame>) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(conn, tx);
    }

    async fn unregister(&self, conn: ConnId) {
        let mut inner = self.inner.write().await;
        inner.connections.remove(&conn);
        inner.rooms.retain(|_, conns| {
            conns.remove(&conn);
            !conns.is_empty()
        });
    }

    async fn subscribe(&self, conn: ConnId, room: RoomId) {
        let mut inner = self.inner.write().await;
        inner.rooms.entry(room).or_default().insert(conn);
    }

    async fn unsubscribe(&self, conn: ConnId, room: RoomId) {
        let mut inner = self.inner.write().await;
        let Some(conns) = inner.rooms.get_mut(&room) else {
            return;
        };
        conns.remove(&conn);
        if conns.is_empty() {
            inner.rooms.remove(&room);
        }
    }

    async fn send_to_room(&self, room: RoomId, frame: &Frame) {
        let inner = self.inner.read().await;
        let Some(conns) = inner.rooms.get(&room) else {
            return;
        };
        for conn in conns {
            let Some(tx) = inner.connections.get(conn) else {
                continue;
            };
            // Best-effort: if a client's channel is full, skip it.
            let _ = tx.try_send(frame.clone());
        }
    }

    async fn send_to_connection(&self, conn: ConnId, frame: &Frame) {
        let inner = self.inner.read().await;
        let Some(tx) = inner.connections.get(&conn) else {
            return;
        };
        let _ = tx.try_send(frame.clone());
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
