//! Hub-side setup: accept loop, connection table, rebroadcast.
//!
//! The hub is passive. It binds once, admits every incoming connection
//! under its announced name, and forwards each inbound message to every
//! other currently-connected peer — the originating connection excluded.
//! It never dials and never enters reconnect logic; each accepted
//! connection lives and dies independently, and no table entry outlives
//! its connection.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::protocol::Message;
use crate::transport::{Connection, Listener, accept_connection};

use super::Coordinator;

// ============================================================================
// Constants
// ============================================================================

/// How often the accept loop re-checks whether it was superseded.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Setup
// ============================================================================

/// Binds the hub listener and starts the accept loop.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if binding fails.
pub(super) async fn setup(coordinator: &Arc<Coordinator>, generation: u64) -> Result<()> {
    let listener = Listener::bind(coordinator.options().hub_addr).await?;
    let local_addr = listener.local_addr();
    *coordinator.hub_addr.lock() = Some(local_addr);

    info!(%local_addr, "hub listening");

    let weak = Arc::downgrade(coordinator);
    tokio::spawn(accept_loop(weak, listener, generation));

    Ok(())
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Background task that admits incoming connections.
///
/// Holds only a weak handle so a dropped coordinator ends the loop; a
/// bumped generation (context reassignment) ends it at the next poll.
async fn accept_loop(coordinator: Weak<Coordinator>, listener: Listener, generation: u64) {
    debug!("accept loop started");

    loop {
        {
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            if coordinator.is_stale(generation) {
                debug!("accept loop superseded");
                break;
            }
        }

        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let weak = Weak::clone(&coordinator);
                tokio::spawn(async move {
                    if let Err(e) = admit(weak, stream, generation).await {
                        warn!(error = %e, ?addr, "connection admission failed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "accept failed");
            }
            Err(_) => {
                // Timeout, re-check the generation.
                continue;
            }
        }
    }

    debug!("accept loop terminated");
}

/// Completes the handshake for one incoming connection and registers it.
async fn admit(coordinator: Weak<Coordinator>, stream: TcpStream, generation: u64) -> Result<()> {
    let handshake_timeout = {
        let Some(coordinator) = coordinator.upgrade() else {
            return Ok(());
        };
        coordinator.options().handshake_timeout
    };

    let connection = accept_connection(stream, handshake_timeout).await?;

    let Some(coordinator) = coordinator.upgrade() else {
        return Ok(());
    };
    if coordinator.is_stale(generation) {
        connection.shutdown();
        return Ok(());
    }

    info!(name = %connection.name(), "peer connected");
    register_peer(&coordinator, connection, generation);
    Ok(())
}

// ============================================================================
// Peer Registration
// ============================================================================

/// Stores a connection in the table and installs its handlers.
fn register_peer(coordinator: &Arc<Coordinator>, connection: Connection, generation: u64) {
    let name = connection.name().to_string();
    let serial = connection.serial();

    let replaced = {
        let mut peers = coordinator.peers.write();
        peers.insert(name.clone(), connection.clone())
    };
    if let Some(old) = replaced {
        debug!(%name, "duplicate connection name; keeping the newest");
        old.shutdown();
    }

    let weak = Arc::downgrade(coordinator);
    let origin = name.clone();
    connection.set_message_handler(Box::new(move |message| {
        if let Some(coordinator) = weak.upgrade() {
            coordinator.dispatch_inbound(&message);
            rebroadcast(&coordinator, &message, &origin);
        }
    }));

    let weak = Arc::downgrade(coordinator);
    connection.set_disconnect_handler(Box::new(move |reason| {
        let Some(coordinator) = weak.upgrade() else {
            return;
        };
        if coordinator.is_stale(generation) {
            return;
        }

        // Remove only our own entry; the name may already belong to a
        // newer connection.
        let mut peers = coordinator.peers.write();
        if peers.get(&name).is_some_and(|c| c.serial() == serial) {
            peers.remove(&name);
            debug!(%name, reason = reason.as_deref().unwrap_or("none"), "peer disconnected");
        }
    }));
}

/// Forwards a message to every connected peer except the originating one.
fn rebroadcast(coordinator: &Coordinator, message: &Message, origin: &str) {
    let peers = coordinator.peers.read();
    for (name, connection) in peers.iter() {
        if name == origin {
            continue;
        }
        connection.send(message.clone());
    }

    trace!(
        id = %message.id,
        origin = %origin,
        peers = peers.len(),
        "message rebroadcast"
    );
}

// ============================================================================
// Tests
// ============================================================================
