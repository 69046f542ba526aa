//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own presence logic and collaborator boundaries so route
//! handlers can stay focused on protocol translation and transport plumbing.

pub mod dispatch;
pub mod membership;
pub mod presence;
