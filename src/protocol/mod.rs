//! Relay protocol message types.
//!
//! This module defines the values that cross the transport between
//! extension contexts.
//!
//! # Protocol Overview
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | [`Announce`] | Client → Hub | First frame, names the connection |
//! | [`Message`] | Any → Any | Relayed application message |
//!
//! Everything after the announcement is a [`Message`]. The hub forwards
//! each inbound message to every other connected peer; delivery to local
//! subscribers is filtered by the optional `target` context tag.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `context` | Execution context and role tags |
//! | `message` | Message envelope, type tags, payloads |

// ============================================================================
// Submodules
// ============================================================================

/// Execution context and role tags.
pub mod context;

/// Message envelope, type tags, payloads.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use context::{Context, Role};
pub use message::{Announce, Message, MessageType, TabInfo};
