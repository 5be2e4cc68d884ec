//! Extension Bus - Message relay between isolated extension contexts.
//!
//! A browser extension runs in three isolated execution environments with
//! no shared memory: a page-embedded content script, a long-lived
//! background worker, and a detachable side panel. This library provides
//! the connection coordinator each of them runs: the background context is
//! the hub that accepts connections and rebroadcasts between peers, while
//! content and panel contexts dial in and recover from disconnects with a
//! fixed backoff.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐        ┌────────────────┐        ┌──────────────┐
//! │ Content      │        │  Background    │        │ Panel        │
//! │ Coordinator  │◄──────►│  Coordinator   │◄──────►│ Coordinator  │
//! │ (client)     │        │  (hub)         │        │ (client)     │
//! └──────────────┘        └────────────────┘        └──────────────┘
//! ```
//!
//! Key design principles:
//!
//! - One explicitly constructed [`Coordinator`] per process; the role
//!   follows from its [`Context`] (`Background` is the hub)
//! - [`Coordinator::send`] is best-effort fire-and-forget: it always
//!   completes, drops silently mid-reconnect, and logs transport failures
//!   rather than surfacing them
//! - A disconnect reporting host invalidation is terminal; everything else
//!   triggers exactly one constant-delay retry
//!
//! # Quick Start
//!
//! ```no_run
//! use extension_bus::{Context, Coordinator, MessageType, Result, Selector};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // The background context hosts the hub.
//!     let coordinator = Coordinator::builder()
//!         .context(Context::Background)
//!         .build()
//!         .await?;
//!
//!     // Observe everything flowing through this context.
//!     coordinator.subscribe(Selector::All, |message| {
//!         println!("{} from {}", message.kind, message.source);
//!     });
//!
//!     // Fire-and-forget broadcast to every connected peer.
//!     coordinator.send(MessageType::TestMessage, json!({ "ping": true }), None);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`coordinator`] | Connection coordinator, builder, options, registry |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`lifecycle`] | Host lifecycle hooks and the panel boundary |
//! | [`protocol`] | Message envelope and context tags |
//! | [`transport`] | WebSocket transport layer (internal) |

// ============================================================================
// Modules
// ============================================================================

/// Connection coordinator, builder, options, registry.
///
/// The core of the crate: use [`Coordinator::builder()`] to create a
/// configured instance for this process's context.
pub mod coordinator;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for relay entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Host lifecycle hooks and the panel boundary.
///
/// Wires install/action/tab notifications into the coordinator.
pub mod lifecycle;

/// Relay protocol message types.
///
/// The message envelope, context tags, and the closed type-tag set.
pub mod protocol;

/// WebSocket transport layer.
///
/// Internal module handling connections and the hub listener.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Coordinator types
pub use coordinator::{
    ConnectionStatus, Coordinator, CoordinatorBuilder, CoordinatorOptions, Selector,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{MessageId, SubscriptionId};

// Lifecycle types
pub use lifecycle::{LifecycleEvent, PanelHost, handle_lifecycle_event};

// Protocol types
pub use protocol::{Context, Message, MessageType, Role, TabInfo};
