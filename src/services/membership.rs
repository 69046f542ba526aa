//! Membership store — read-only authorization oracle.
//!
//! ARCHITECTURE
//! ============
//! Room records and membership rows are owned by the room catalog service;
//! this module only answers "which rooms does this user belong to" and "is
//! this user a member of that room". Presence logic consumes it behind a
//! trait so tests can substitute an in-memory store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::frame::ErrorCode;
use crate::registry::RoomId;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for MembershipError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// A member's standing in a room. Owners count as members for every
/// authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Owner,
}

// =============================================================================
// STORE BOUNDARY
// =============================================================================

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Every room the user belongs to, in any role.
    async fn list_user_rooms(&self, user_id: &str) -> Result<Vec<RoomId>, MembershipError>;

    /// Whether the user belongs to the room, in any role.
    async fn is_member(&self, user_id: &str, room_id: RoomId) -> Result<bool, MembershipError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

/// Membership store backed by the `room_members` table.
pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn list_user_rooms(&self, user_id: &str) -> Result<Vec<RoomId>, MembershipError> {
        let rooms = sqlx::query_scalar::<_, i64>(
            "SELECT room_id FROM room_members WHERE user_id = $1 ORDER BY room_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rooms)
    }

    async fn is_member(&self, user_id: &str, room_id: RoomId) -> Result<bool, MembershipError> {
        let is_member: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM room_members WHERE user_id = $1 AND room_id = $2
            )",
        )
        .bind(user_id)
        .bind(room_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(is_member)
    }
}

#[cfg(test)]
#[path = "membership_test.rs"]
mod tests;
