//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! carries the three presence collaborators: the membership store (read-only
//! authorization oracle), the presence registry (the only shared mutable
//! resource, internally synchronized), and the broadcast dispatcher. Each is
//! an owned, injectable handle rather than ambient global state, so tests
//! can instantiate isolated instances.

use std::sync::Arc;

use crate::registry::PresenceRegistry;
use crate::services::dispatch::{ChannelDispatcher, Dispatcher};
use crate::services::membership::MembershipStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    /// Authorization oracle. Owns its own database pool.
    pub membership: Arc<dyn MembershipStore>,
    /// Who is online in which room.
    pub registry: Arc<PresenceRegistry>,
    /// Outbound event fan-out.
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl AppState {
    #[must_use]
    pub fn new(membership: Arc<dyn MembershipStore>) -> Self {
        Self {
            membership,
            registry: Arc::new(PresenceRegistry::new()),
            dispatcher: Arc::new(ChannelDispatcher::new()),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
