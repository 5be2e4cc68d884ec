//! Client-side setup and reconnect policy.
//!
//! A client context keeps at most one outbound connection to the hub. The
//! first dial is deferred briefly so the hub's accepting end can finish
//! initializing. On disconnect the cause is classified first: a host error
//! reporting that this extension context was torn down is terminal, and
//! any other action would throw against a dead host. Every other cause
//! schedules exactly one retry after a fixed delay.
//!
//! Scheduled work carries the coordinator generation it was created under;
//! a context reassignment bumps the generation and the stale timer does
//! nothing when it fires.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::protocol::{Context, message::now_ms};
use crate::transport::Connection;

use super::Coordinator;

// ============================================================================
// Constants
// ============================================================================

/// Substring the host uses when reporting that the extension context
/// backing this process has been torn down.
const CONTEXT_INVALIDATED_MARKER: &str = "Extension context invalidated";

// ============================================================================
// Setup
// ============================================================================

/// Schedules the first connection attempt for a client coordinator.
///
/// Idempotent: a second call while setup is already in progress is skipped,
/// so repeated context-setting cannot produce duplicate concurrent dials.
pub(super) fn setup(coordinator: &Arc<Coordinator>, generation: u64) {
    if coordinator.setup_in_progress.swap(true, Ordering::SeqCst) {
        debug!("client setup already in progress; skipping");
        return;
    }

    let delay = coordinator.options().initial_connect_delay;
    debug!(
        delay_ms = delay.as_millis() as u64,
        "scheduling first connection attempt"
    );

    let weak = Arc::downgrade(coordinator);
    tokio::spawn(async move {
        sleep(delay).await;

        let Some(coordinator) = weak.upgrade() else {
            return;
        };
        if coordinator.is_stale(generation) || coordinator.invalidated.load(Ordering::SeqCst) {
            return;
        }

        attempt_connect(&coordinator, generation).await;
    });
}

// ============================================================================
// Connection Attempts
// ============================================================================

/// Dials the hub once, installing handlers on success.
///
/// A failed dial is treated identically to a disconnect and enters the
/// reconnect policy.
async fn attempt_connect(coordinator: &Arc<Coordinator>, generation: u64) {
    let context = coordinator.context();
    let name = connection_name(context);
    coordinator.connect_attempts.fetch_add(1, Ordering::SeqCst);

    match Connection::dial(coordinator.options().hub_addr, name.clone()).await {
        Ok(connection) => {
            {
                let mut slot = coordinator.connection.lock();
                if coordinator.is_stale(generation) {
                    drop(slot);
                    connection.shutdown();
                    return;
                }
                *slot = Some(connection.clone());
            }

            install_handlers(coordinator, &connection, generation);
            info!(name = %name, "connected to hub");
        }
        Err(e) => {
            warn!(error = %e, "connection attempt failed");
            handle_disconnect(coordinator, generation, Some(e.to_string()));
        }
    }
}

/// Registers the inbound-message and disconnect handlers.
fn install_handlers(coordinator: &Arc<Coordinator>, connection: &Connection, generation: u64) {
    let weak = Arc::downgrade(coordinator);
    connection.set_message_handler(Box::new(move |message| {
        if let Some(coordinator) = weak.upgrade() {
            coordinator.dispatch_inbound(&message);
        }
    }));

    let weak = Arc::downgrade(coordinator);
    connection.set_disconnect_handler(Box::new(move |reason| {
        if let Some(coordinator) = weak.upgrade() {
            handle_disconnect(&coordinator, generation, reason);
        }
    }));
}

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Classifies a disconnect and schedules the single retry when recoverable.
fn handle_disconnect(coordinator: &Arc<Coordinator>, generation: u64, reason: Option<String>) {
    if coordinator.is_stale(generation) {
        return;
    }

    coordinator.connection.lock().take();

    if let Some(ref text) = reason
        && is_invalidation(text)
    {
        coordinator.invalidated.store(true, Ordering::SeqCst);
        warn!("extension context invalidated; reconnection disabled");
        return;
    }

    if coordinator.invalidated.load(Ordering::SeqCst) {
        return;
    }

    let delay = coordinator.options().reconnect_delay;
    debug!(
        delay_ms = delay.as_millis() as u64,
        reason = reason.as_deref().unwrap_or("none"),
        "reconnect scheduled"
    );

    let weak = Arc::downgrade(coordinator);
    tokio::spawn(async move {
        sleep(delay).await;

        let Some(coordinator) = weak.upgrade() else {
            return;
        };
        if coordinator.is_stale(generation) || coordinator.invalidated.load(Ordering::SeqCst) {
            return;
        }

        attempt_connect(&coordinator, generation).await;
    });
}

/// Returns `true` if the host reported this context as torn down.
fn is_invalidation(reason: &str) -> bool {
    reason.contains(CONTEXT_INVALIDATED_MARKER)
}

/// Builds a unique connection name from the context tag and creation time.
fn connection_name(context: Context) -> String {
    format!("{}-{}", context, now_ms())
}

// ============================================================================
// Tests
// ============================================================================
