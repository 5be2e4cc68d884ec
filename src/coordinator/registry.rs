//! Subscriber registry.
//!
//! Maps message types to ordered lists of handler callbacks. A
//! subscription either names a specific [`MessageType`] or matches all
//! types; the wildcard is its own list rather than a sentinel tag, so an
//! inbound message with an unrecognized type tag still reaches wildcard
//! subscribers.
//!
//! Dispatch runs over a snapshot of the registered handlers: a handler may
//! unsubscribe itself or others mid-dispatch without skipping or
//! double-invoking unaffected handlers. A panicking handler is isolated
//! and does not prevent delivery to subsequent handlers.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::identifiers::SubscriptionId;
use crate::protocol::{Message, MessageType};

// ============================================================================
// Types
// ============================================================================

/// Subscriber handler callback type.
///
/// Invoked synchronously on the inbound-message path.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

// ============================================================================
// Selector
// ============================================================================

/// What a subscription matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Matches every message, including unrecognized type tags.
    All,
    /// Matches one message type.
    Kind(MessageType),
}

impl From<MessageType> for Selector {
    fn from(kind: MessageType) -> Self {
        Self::Kind(kind)
    }
}

// ============================================================================
// SubscriberRegistry
// ============================================================================

/// One registered handler.
struct Entry {
    id: SubscriptionId,
    handler: Handler,
}

/// Handler lists, guarded together by a single lock.
#[derive(Default)]
struct Lists {
    /// Per-type handlers, in registration order.
    by_kind: FxHashMap<MessageType, Vec<Entry>>,
    /// Wildcard handlers, in registration order.
    wildcard: Vec<Entry>,
}

/// Registry of message subscribers for one coordinator.
#[derive(Default)]
pub struct SubscriberRegistry {
    lists: Mutex<Lists>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under the given selector.
    ///
    /// Returns the ID that removes exactly this registration. Registering
    /// the same handler twice yields two independently removable entries.
    pub fn subscribe(&self, selector: Selector, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId::next();
        let entry = Entry { id, handler };

        let mut lists = self.lists.lock();
        match selector {
            Selector::All => lists.wildcard.push(entry),
            Selector::Kind(kind) => lists.by_kind.entry(kind).or_default().push(entry),
        }

        trace!(%id, ?selector, "subscriber registered");
        id
    }

    /// Removes the registration with the given ID.
    ///
    /// Returns `false` if no such registration exists (already removed).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut lists = self.lists.lock();

        if let Some(position) = lists.wildcard.iter().position(|e| e.id == id) {
            lists.wildcard.remove(position);
            trace!(%id, "subscriber removed");
            return true;
        }

        for entries in lists.by_kind.values_mut() {
            if let Some(position) = entries.iter().position(|e| e.id == id) {
                entries.remove(position);
                trace!(%id, "subscriber removed");
                return true;
            }
        }

        false
    }

    /// Returns the number of registered handlers across all lists.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        let lists = self.lists.lock();
        lists.wildcard.len() + lists.by_kind.values().map(Vec::len).sum::<usize>()
    }

    /// Delivers a message to every matching handler, in registration order
    /// (type-specific first, then wildcard).
    ///
    /// Each handler invocation is isolated: a panic is logged and dispatch
    /// continues with the next handler.
    pub fn dispatch(&self, message: &Message) {
        let snapshot: Vec<Handler> = {
            let lists = self.lists.lock();
            let mut handlers = Vec::new();

            if let Some(kind) = message.message_type()
                && let Some(entries) = lists.by_kind.get(&kind)
            {
                handlers.extend(entries.iter().map(|e| Arc::clone(&e.handler)));
            }
            handlers.extend(lists.wildcard.iter().map(|e| Arc::clone(&e.handler)));

            handlers
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!(kind = %message.kind, "subscriber panicked during dispatch");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
