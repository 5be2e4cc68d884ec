//! Transport connection and event loop.
//!
//! A [`Connection`] is one ordered bidirectional channel between a client
//! context and the hub, identified by a unique name. The connection spawns
//! a tokio task that handles:
//!
//! - Incoming frames from the peer (deserialized into [`Message`] values)
//! - Outgoing messages from the local coordinator
//! - Disconnect detection and classification data (close reason / error)
//!
//! Sends are best-effort: serialization and transport failures are logged
//! and swallowed, never surfaced to the caller. A dropped status message
//! must not throw back into application logic.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{from_str, to_string};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::protocol::{Announce, Message};

// ============================================================================
// Types
// ============================================================================

/// Inbound message callback type.
///
/// Called for each message received on this connection.
pub type MessageCallback = Box<dyn Fn(Message) + Send + Sync>;

/// Disconnect callback type.
///
/// Called at most once, when the peer or the transport tears the
/// connection down. Carries the optional error descriptor (close-frame
/// reason or stream error text). Not called for local shutdown.
pub type DisconnectCallback = Box<dyn FnOnce(Option<String>) + Send>;

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write a message to the peer.
    Send(Message),
    /// Close the connection, optionally carrying an error descriptor
    /// the peer can observe in its close frame.
    Close {
        /// Reason placed in the close frame, if any.
        reason: Option<String>,
    },
}

// ============================================================================
// DisconnectSlot
// ============================================================================

/// Holds the disconnect callback, or the reason of a disconnect that fired
/// before any callback was installed.
///
/// One lock guards both fields so a disconnect racing handler installation
/// is never lost: whichever side arrives second observes the first.
#[derive(Default)]
struct DisconnectSlot {
    handler: Option<DisconnectCallback>,
    pending: Option<Option<String>>,
}

// ============================================================================
// Connection
// ============================================================================

/// Process-local counter backing connection serials.
static NEXT_CONNECTION_SERIAL: AtomicU64 = AtomicU64::new(1);

/// One named, ordered, bidirectional channel to a peer.
///
/// Cloning yields another handle to the same underlying connection.
/// Dropping the last handle tears the event loop down.
pub struct Connection {
    /// Unique connection name (role tag + creation time).
    name: String,
    /// Process-local identity; names can collide, serials cannot.
    serial: u64,
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Inbound message handler (shared with event loop).
    on_message: Arc<Mutex<Option<MessageCallback>>>,
    /// Disconnect handler slot (shared with event loop).
    on_disconnect: Arc<Mutex<DisconnectSlot>>,
    /// Last transport error, readable synchronously after disconnect.
    last_error: Arc<Mutex<Option<String>>>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            serial: self.serial,
            command_tx: self.command_tx.clone(),
            on_message: Arc::clone(&self.on_message),
            on_disconnect: Arc::clone(&self.on_disconnect),
            last_error: Arc::clone(&self.last_error),
        }
    }
}

impl Connection {
    /// Creates a connection from an established WebSocket stream.
    ///
    /// Spawns the event loop task internally.
    pub(crate) fn new<S>(ws_stream: WebSocketStream<S>, name: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let on_message: Arc<Mutex<Option<MessageCallback>>> = Arc::new(Mutex::new(None));
        let on_disconnect: Arc<Mutex<DisconnectSlot>> =
            Arc::new(Mutex::new(DisconnectSlot::default()));
        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            Arc::clone(&on_message),
            Arc::clone(&on_disconnect),
            Arc::clone(&last_error),
        ));

        Self {
            name: name.into(),
            serial: NEXT_CONNECTION_SERIAL.fetch_add(1, Ordering::Relaxed),
            command_tx,
            on_message,
            on_disconnect,
            last_error,
        }
    }

    /// Dials the hub at `addr`, announcing this connection's name.
    ///
    /// The announcement travels as the first frame so the hub can key its
    /// connection table before any message flows.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::WebSocket`] if the connection cannot be established
    /// - [`crate::Error::Json`] if the announcement cannot be serialized
    pub async fn dial(addr: SocketAddr, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let url = format!("ws://{addr}");

        let (mut ws_stream, _response) = connect_async(url.as_str()).await?;

        let announce = to_string(&Announce { name: name.clone() })?;
        ws_stream.send(WsMessage::Text(announce.into())).await?;

        debug!(name = %name, %addr, "connection established");
        Ok(Self::new(ws_stream, name))
    }

    /// Returns the unique connection name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the process-local connection serial.
    ///
    /// Clones of the same connection share a serial; two connections never
    /// do, even when their announced names collide.
    #[inline]
    #[must_use]
    pub(crate) const fn serial(&self) -> u64 {
        self.serial
    }

    /// Sets the inbound message handler.
    ///
    /// Frames arriving before a handler is installed are dropped.
    pub fn set_message_handler(&self, handler: MessageCallback) {
        let mut guard = self.on_message.lock();
        *guard = Some(handler);
    }

    /// Sets the disconnect handler.
    ///
    /// If the connection already disconnected, the handler fires
    /// immediately with the recorded reason.
    pub fn set_disconnect_handler(&self, handler: DisconnectCallback) {
        let pending = {
            let mut slot = self.on_disconnect.lock();
            match slot.pending.take() {
                Some(reason) => Some(reason),
                None => {
                    slot.handler = Some(handler);
                    return;
                }
            }
        };

        if let Some(reason) = pending {
            handler(reason);
        }
    }

    /// Writes a message to the peer, best-effort.
    ///
    /// If the event loop has already terminated the message is dropped
    /// with a log line, matching the delivery contract.
    pub fn send(&self, message: Message) {
        if self.command_tx.send(ConnectionCommand::Send(message)).is_err() {
            debug!(name = %self.name, "connection task gone; message dropped");
        }
    }

    /// Closes the connection silently.
    ///
    /// The local disconnect handler does not fire; the peer observes an
    /// ordinary close.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Close { reason: None });
    }

    /// Closes the connection with an error descriptor in the close frame.
    ///
    /// The peer's disconnect handler receives `reason`, which is how the
    /// host's teardown errors (including invalidation) are observed.
    pub fn close_with_reason(&self, reason: impl Into<String>) {
        let _ = self.command_tx.send(ConnectionCommand::Close {
            reason: Some(reason.into()),
        });
    }

    /// Returns the last transport error, if any.
    ///
    /// Readable synchronously after the disconnect handler fires.
    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Connection {
    /// Event loop that handles transport I/O.
    async fn run_event_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        on_message: Arc<Mutex<Option<MessageCallback>>>,
        on_disconnect: Arc<Mutex<DisconnectSlot>>,
        last_error: Arc<Mutex<Option<String>>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let mut reason: Option<String> = None;
        let mut locally_closed = false;

        loop {
            tokio::select! {
                // Incoming frames from the peer
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            Self::handle_incoming_frame(text.as_str(), &on_message);
                        }

                        Some(Ok(WsMessage::Close(frame))) => {
                            reason = frame.and_then(|f| {
                                let text = f.reason.as_str();
                                (!text.is_empty()).then(|| text.to_string())
                            });
                            debug!(?reason, "connection closed by peer");
                            break;
                        }

                        Some(Err(e)) => {
                            reason = Some(e.to_string());
                            error!(error = %e, "transport error");
                            break;
                        }

                        None => {
                            debug!("transport stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Commands from the local coordinator
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(message)) => {
                            Self::handle_send_command(message, &mut ws_write).await;
                        }

                        Some(ConnectionCommand::Close { reason: close_reason }) => {
                            debug!(?close_reason, "close command received");
                            let frame = close_reason.map(|text| CloseFrame {
                                code: CloseCode::Away,
                                reason: text.into(),
                            });
                            let _ = ws_write.send(WsMessage::Close(frame)).await;
                            let _ = ws_write.close().await;
                            locally_closed = true;
                            break;
                        }

                        None => {
                            debug!("command channel closed");
                            let _ = ws_write.close().await;
                            locally_closed = true;
                            break;
                        }
                    }
                }
            }
        }

        // Record the error first so it is readable from within the
        // disconnect handler.
        if let Some(ref text) = reason {
            *last_error.lock() = Some(text.clone());
        }

        // Local teardown is deliberate; only remote teardown notifies.
        if !locally_closed {
            let handler = {
                let mut slot = on_disconnect.lock();
                match slot.handler.take() {
                    Some(handler) => Some(handler),
                    None => {
                        slot.pending = Some(reason.clone());
                        None
                    }
                }
            };

            if let Some(handler) = handler {
                handler(reason);
            }
        }

        debug!("event loop terminated");
    }

    /// Handles an incoming text frame from the peer.
    fn handle_incoming_frame(text: &str, on_message: &Arc<Mutex<Option<MessageCallback>>>) {
        match from_str::<Message>(text) {
            Ok(message) => {
                trace!(id = %message.id, kind = %message.kind, "message received");
                let handler = on_message.lock();
                if let Some(ref handler) = *handler {
                    handler(message);
                }
            }
            Err(e) => {
                warn!(error = %e, text = %text, "failed to parse incoming frame");
            }
        }
    }

    /// Handles a send command from the local coordinator.
    async fn handle_send_command<S>(
        message: Message,
        ws_write: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let json = match to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound message");
                return;
            }
        };

        if let Err(e) = ws_write.send(WsMessage::Text(json.into())).await {
            warn!(error = %e, "failed to send message");
            return;
        }

        trace!(id = %message.id, kind = %message.kind, "message sent");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to find a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let result = Connection::dial(addr, "content-1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_sends_announce_first() {
        let listener = tokio::net::TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => text.as_str().to_string(),
                other => panic!("expected announce frame, got {other:?}"),
            }
        });

        let connection = Connection::dial(addr, "panel-42").await.expect("dial");
        assert_eq!(connection.name(), "panel-42");

        let first_frame = server.await.expect("server task");
        let announce: Announce = serde_json::from_str(&first_frame).expect("parse announce");
        assert_eq!(announce.name, "panel-42");
    }

    #[tokio::test]
    async fn test_disconnect_handler_fires_when_set_late() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            let _ = ws.next().await; // announce
            // Close immediately, before the client installs handlers.
            let _ = ws.close(None).await;
        });

        let connection = Connection::dial(addr, "content-1").await.expect("dial");
        server.await.expect("server task");

        // Give the event loop time to observe the close.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let (tx, rx) = std::sync::mpsc::channel();
        connection.set_disconnect_handler(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));

        // The slot replays the missed disconnect at installation time.
        let reason = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("disconnect handler should fire");
        assert!(reason.is_none());
    }
}
