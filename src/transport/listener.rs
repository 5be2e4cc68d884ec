//! Listen-for-incoming side of the transport.
//!
//! The hub binds a [`Listener`] and admits each incoming connection by
//! upgrading it to a WebSocket and reading the client's name-announcement
//! frame under a timeout.
//!
//! # Connection Flow
//!
//! 1. Hub binds to its configured address (port 0 for tests)
//! 2. Client dials and announces its unique connection name
//! 3. Hub stores the named [`Connection`] in its connection table
//! 4. Messages flow; on disconnect the table entry is removed

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Announce;

use super::Connection;

// ============================================================================
// Listener
// ============================================================================

/// Accept side of the transport, owned by the hub coordinator.
pub struct Listener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds a listener to the specified address.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "listener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the address the listener is bound to.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next raw TCP connection.
    ///
    /// The caller completes admission with [`accept_connection`] so a slow
    /// handshake never blocks the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if accepting fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(?addr, "TCP connection accepted");
        Ok((stream, addr))
    }
}

// ============================================================================
// Admission
// ============================================================================

/// Upgrades a raw TCP connection and reads the name announcement.
///
/// # Errors
///
/// - [`Error::Connection`] if the WebSocket upgrade fails
/// - [`Error::ConnectionTimeout`] if no announcement arrives in time
/// - [`Error::ConnectionClosed`] if the peer hangs up before announcing
/// - [`Error::Protocol`] if the first frame is not a valid announcement
pub async fn accept_connection(
    stream: TcpStream,
    handshake_timeout: Duration,
) -> Result<Connection> {
    let mut ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    let frame = timeout(handshake_timeout, ws_stream.next())
        .await
        .map_err(|_| Error::connection_timeout(handshake_timeout.as_millis() as u64))?;

    let text = match frame {
        Some(Ok(WsMessage::Text(text))) => text,
        Some(Ok(_)) => return Err(Error::protocol("first frame must be a text announcement")),
        Some(Err(e)) => return Err(Error::connection(format!("handshake failed: {e}"))),
        None => return Err(Error::ConnectionClosed),
    };

    let announce: Announce = serde_json::from_str(text.as_str())
        .map_err(|e| Error::protocol(format!("invalid announcement: {e}")))?;

    debug!(name = %announce.name, "connection announced");

    Ok(Connection::new(ws_stream, announce.name))
}

// ============================================================================
// Tests
// ============================================================================
