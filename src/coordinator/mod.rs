//! Connection coordinator.
//!
//! One [`Coordinator`] per process owns that context's transport lifecycle:
//! role state, the client connection or the hub's connection table, the
//! reconnect policy, the subscriber registry, and rebroadcast logic.
//!
//! # Roles
//!
//! The coordinator's behavior follows from its [`Context`]:
//!
//! - **Client** (content script, panel): dials the hub after a short delay,
//!   keeps at most one outbound connection, and retries once after a fixed
//!   backoff when the connection drops. A disconnect whose error indicates
//!   the extension context was torn down is terminal: no further transport
//!   activity for this process lifetime.
//! - **Hub** (background): accepts connections, keys them by announced
//!   name, and forwards every inbound message to every other peer. The hub
//!   never dials and never reconnects.
//!
//! # Delivery contract
//!
//! [`Coordinator::send`] is best-effort and infallible by design: it stamps
//! and writes the message if a connection exists, silently drops it
//! mid-reconnect, and logs (never surfaces) transport failures. A sender
//! does not receive its own messages; subscribe-and-self-deliver if you
//! need to observe them.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | Fluent coordinator construction |
//! | `client` | Dial-side setup and reconnect policy |
//! | `hub` | Accept loop, connection table, rebroadcast |
//! | `options` | Timing and address configuration |
//! | `registry` | Subscriber registry |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent coordinator construction.
pub mod builder;

/// Dial-side setup and reconnect policy.
mod client;

/// Accept loop, connection table, rebroadcast.
mod hub;

/// Timing and address configuration.
pub mod options;

/// Subscriber registry.
pub mod registry;

pub use builder::CoordinatorBuilder;
pub use options::CoordinatorOptions;
pub use registry::Selector;

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::error::Result;
use crate::identifiers::{MessageId, SubscriptionId};
use crate::protocol::{Context, Message, MessageType, Role};
use crate::transport::Connection;

use registry::{Handler, SubscriberRegistry};

// ============================================================================
// ConnectionStatus
// ============================================================================

/// Connected/disconnected flag exposed to the UI layer.
///
/// The only user-visible failure indicator; no error text is shown to the
/// end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The last connection attempt succeeded (client), or the hub is
    /// listening.
    Connected,
    /// No live transport right now.
    Disconnected,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Per-process connection coordinator.
///
/// Explicitly constructed and owned; one instance per process is a
/// consequence of process isolation, not a global. Construct via
/// [`Coordinator::builder`].
pub struct Coordinator {
    /// Timing and address configuration.
    options: CoordinatorOptions,

    /// The execution context this coordinator serves.
    context: RwLock<Context>,

    /// Bumped on context reassignment and shutdown; scheduled work from a
    /// previous role observes the mismatch and does nothing.
    generation: AtomicU64,

    /// Guards against duplicate concurrent client setup.
    setup_in_progress: AtomicBool,

    /// Terminal flag: the host tore this extension context down.
    invalidated: AtomicBool,

    /// The single outbound connection (client role).
    connection: Mutex<Option<Connection>>,

    /// Connection table keyed by announced name (hub role).
    peers: RwLock<FxHashMap<String, Connection>>,

    /// Local subscribers.
    registry: SubscriberRegistry,

    /// Address the hub is actually bound to (hub role).
    hub_addr: Mutex<Option<SocketAddr>>,

    /// Number of dial attempts made (client role). Diagnostic.
    connect_attempts: AtomicU64,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("options", &self.options)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field(
                "setup_in_progress",
                &self.setup_in_progress.load(Ordering::Relaxed),
            )
            .field("invalidated", &self.invalidated.load(Ordering::Relaxed))
            .field("connect_attempts", &self.connect_attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Coordinator - Construction
// ============================================================================

impl Coordinator {
    /// Returns a builder for configuring a coordinator.
    #[inline]
    #[must_use]
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Creates a coordinator without running setup.
    pub(crate) fn with_options(context: Context, options: CoordinatorOptions) -> Self {
        Self {
            options,
            context: RwLock::new(context),
            generation: AtomicU64::new(0),
            setup_in_progress: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            connection: Mutex::new(None),
            peers: RwLock::new(FxHashMap::default()),
            registry: SubscriberRegistry::new(),
            hub_addr: Mutex::new(None),
            connect_attempts: AtomicU64::new(0),
        }
    }

    /// Runs role-appropriate setup for the current context.
    pub(crate) async fn setup(self: &Arc<Self>, generation: u64) -> Result<()> {
        match self.context().role() {
            Role::Hub => hub::setup(self, generation).await,
            Role::Client => {
                client::setup(self, generation);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Coordinator - Public API
// ============================================================================

impl Coordinator {
    /// Reassigns this coordinator's context.
    ///
    /// A no-op when the context is unchanged. Otherwise discards all
    /// transport and backoff state (including a pending invalidation) and
    /// reruns role-appropriate setup, so a process may start with a
    /// provisional default context and be corrected once its true context
    /// is known.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the new context is the hub and its
    /// listener cannot bind.
    pub async fn set_context(self: &Arc<Self>, context: Context) -> Result<()> {
        {
            let current = self.context.read();
            if *current == context {
                debug!(%context, "context unchanged; skipping re-setup");
                return Ok(());
            }
        }

        *self.context.write() = context;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.setup_in_progress.store(false, Ordering::SeqCst);
        self.invalidated.store(false, Ordering::SeqCst);
        self.reset_transport();

        info!(%context, "context reassigned");
        self.setup(generation).await
    }

    /// Returns the current context.
    #[inline]
    #[must_use]
    pub fn context(&self) -> Context {
        *self.context.read()
    }

    /// Sends a message, best-effort.
    ///
    /// Stamps a fresh ID, this coordinator's context as source, and the
    /// current time. A hub broadcasts to every connected peer; a client
    /// writes to its single connection, or silently drops the message when
    /// none exists (mid-reconnect). Always completes; transport failures
    /// are logged, never surfaced. Local subscribers are not invoked.
    pub fn send(&self, kind: MessageType, payload: Value, target: Option<Context>) -> MessageId {
        let context = self.context();
        let message = Message::new(kind, payload, context, target);
        let id = message.id;

        match context.role() {
            Role::Hub => {
                // Locally originated, so nothing to exclude.
                let peers = self.peers.read();
                for connection in peers.values() {
                    connection.send(message.clone());
                }
                trace!(%id, %kind, peers = peers.len(), "hub broadcast");
            }
            Role::Client => {
                let connection = self.connection.lock();
                match connection.as_ref() {
                    Some(connection) => connection.send(message),
                    None => debug!(%id, %kind, "no active connection; message dropped"),
                }
            }
        }

        id
    }

    /// Registers a subscriber for inbound messages.
    ///
    /// `selector` is either a single [`MessageType`] (via `Into`) or
    /// [`Selector::All`]. Handlers run synchronously on the inbound path,
    /// in registration order; a panicking handler does not prevent
    /// delivery to the rest.
    pub fn subscribe<F>(&self, selector: impl Into<Selector>, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.registry.subscribe(selector.into(), handler)
    }

    /// Removes the subscription with the given ID.
    ///
    /// Removes exactly that registration; other handlers on the same type
    /// are unaffected. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Returns the connected/disconnected status flag.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let connected = match self.context().role() {
            Role::Hub => self.hub_addr.lock().is_some(),
            Role::Client => self.connection.lock().is_some(),
        };

        if connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    /// Returns the number of connected peers (hub role).
    #[inline]
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns the number of dial attempts made (client role). Diagnostic.
    #[inline]
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Returns the address the hub is bound to, once listening.
    ///
    /// Useful when binding port 0.
    #[inline]
    #[must_use]
    pub fn hub_addr(&self) -> Option<SocketAddr> {
        *self.hub_addr.lock()
    }

    /// Tears down all transport state and suppresses scheduled work.
    pub fn shutdown(&self) {
        info!("coordinator shutting down");
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reset_transport();
    }
}

// ============================================================================
// Coordinator - Internals
// ============================================================================

impl Coordinator {
    /// Returns the timing and address configuration.
    #[inline]
    pub(crate) fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Returns the current generation.
    #[inline]
    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns `true` if work stamped with `generation` was superseded.
    #[inline]
    pub(crate) fn is_stale(&self, generation: u64) -> bool {
        self.current_generation() != generation
    }

    /// Delivers an inbound message to local subscribers.
    ///
    /// Messages targeted at a different context are dropped before
    /// dispatch; broadcasts are for everyone.
    pub(crate) fn dispatch_inbound(&self, message: &Message) {
        let context = self.context();
        if !message.is_for(context) {
            trace!(
                id = %message.id,
                target = ?message.target,
                "message targeted elsewhere; skipped"
            );
            return;
        }

        self.registry.dispatch(message);
    }

    /// Discards the client connection and drains the hub connection table.
    fn reset_transport(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.shutdown();
            debug!("client connection discarded");
        }

        let peers: Vec<(String, Connection)> = {
            let mut peers = self.peers.write();
            peers.drain().collect()
        };
        for (name, connection) in peers {
            connection.shutdown();
            debug!(%name, "peer connection closed");
        }

        self.hub_addr.lock().take();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use serde_json::json;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Opt-in test logging via RUST_LOG.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Short delays so tests never wait out real backoffs.
    fn fast_options(hub_addr: SocketAddr) -> CoordinatorOptions {
        CoordinatorOptions::new()
            .with_hub_addr(hub_addr)
            .with_initial_connect_delay(Duration::from_millis(10))
            .with_reconnect_delay(Duration::from_millis(50))
    }

    async fn spawn_hub() -> Arc<Coordinator> {
        init_tracing();
        Coordinator::builder()
            .context(Context::Background)
            .hub_addr(localhost(0))
            .build()
            .await
            .expect("hub should build")
    }

    async fn spawn_client(context: Context, hub: &Arc<Coordinator>) -> Arc<Coordinator> {
        let addr = hub.hub_addr().expect("hub should be bound");
        Coordinator::builder()
            .context(context)
            .options(fast_options(addr))
            .build()
            .await
            .expect("client should build")
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Collects messages a subscriber receives.
    fn collect(coordinator: &Coordinator, selector: Selector) -> Arc<Mutex<Vec<Message>>> {
        let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        coordinator.subscribe(selector, move |message| sink.lock().push(message.clone()));
        received
    }

    #[tokio::test]
    async fn test_hub_binds_and_reports_status() {
        let hub = spawn_hub().await;

        assert!(hub.hub_addr().is_some());
        assert_eq!(hub.status(), ConnectionStatus::Connected);
        assert_eq!(hub.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_client_connects_to_hub() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Panel, &hub).await;

        wait_for("client to connect", || {
            hub.peer_count() == 1 && client.status() == ConnectionStatus::Connected
        })
        .await;

        assert_eq!(client.connect_attempts(), 1);

        // The connection name carries the context tag.
        let peers = hub.peers.read();
        let name = peers.keys().next().expect("one peer");
        assert!(name.starts_with("panel-"));
    }

    #[tokio::test]
    async fn test_same_context_is_noop() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Content, &hub).await;

        wait_for("client to connect", || hub.peer_count() == 1).await;
        assert_eq!(client.connect_attempts(), 1);

        // Re-setting the same context schedules no new attempt.
        client
            .set_context(Context::Content)
            .await
            .expect("noop set_context");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(client.connect_attempts(), 1);
        assert_eq!(hub.peer_count(), 1);
        assert_eq!(client.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = spawn_hub().await;
        let content = spawn_client(Context::Content, &hub).await;
        let panel = spawn_client(Context::Panel, &hub).await;

        wait_for("both clients to connect", || hub.peer_count() == 2).await;

        let at_hub = collect(&hub, Selector::All);
        let at_content = collect(&content, Selector::All);
        let at_panel = collect(&panel, Selector::All);

        content.send(
            MessageType::ContentReady,
            json!({ "url": "https://x" }),
            None,
        );

        wait_for("hub and panel to receive", || {
            at_hub.lock().len() == 1 && at_panel.lock().len() == 1
        })
        .await;

        // The sender never hears its own message back.
        assert!(at_content.lock().is_empty());

        let delivered = at_panel.lock()[0].clone();
        assert_eq!(delivered.kind, "CONTENT_READY");
        assert_eq!(delivered.source, Context::Content);
        assert_eq!(delivered.payload["url"], "https://x");
    }

    #[tokio::test]
    async fn test_hub_subscribers_see_each_message_once() {
        let hub = spawn_hub().await;
        let content = spawn_client(Context::Content, &hub).await;
        let panel = spawn_client(Context::Panel, &hub).await;

        wait_for("both clients to connect", || hub.peer_count() == 2).await;

        let at_hub = collect(&hub, Selector::All);

        content.send(MessageType::TestMessage, json!({ "n": 1 }), None);
        panel.send(MessageType::TestMessage, json!({ "n": 2 }), None);
        content.send(MessageType::TestMessage, json!({ "n": 3 }), None);

        wait_for("hub to receive all three", || at_hub.lock().len() >= 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let received = at_hub.lock();
        assert_eq!(received.len(), 3);

        let ids: std::collections::HashSet<_> = received.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_hub_send_reaches_every_peer() {
        let hub = spawn_hub().await;
        let content = spawn_client(Context::Content, &hub).await;
        let panel = spawn_client(Context::Panel, &hub).await;

        wait_for("both clients to connect", || hub.peer_count() == 2).await;

        let at_content = collect(&content, Selector::Kind(MessageType::TestMessage));
        let at_panel = collect(&panel, Selector::Kind(MessageType::TestMessage));

        hub.send(MessageType::TestMessage, json!({ "ping": true }), None);

        wait_for("both clients to receive", || {
            at_content.lock().len() == 1 && at_panel.lock().len() == 1
        })
        .await;

        assert_eq!(at_content.lock()[0].source, Context::Background);
    }

    #[tokio::test]
    async fn test_targeted_message_skips_other_contexts() {
        let hub = spawn_hub().await;
        let content = spawn_client(Context::Content, &hub).await;
        let panel = spawn_client(Context::Panel, &hub).await;

        wait_for("both clients to connect", || hub.peer_count() == 2).await;

        let at_hub = collect(&hub, Selector::All);
        let at_panel = collect(&panel, Selector::All);

        content.send(
            MessageType::TestMessage,
            json!({ "for": "panel" }),
            Some(Context::Panel),
        );

        wait_for("panel to receive", || at_panel.lock().len() == 1).await;

        // The hub forwarded it but its own subscribers never saw it.
        assert!(at_hub.lock().is_empty());
        assert_eq!(at_panel.lock()[0].target, Some(Context::Panel));
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Panel, &hub).await;

        wait_for("client to connect", || hub.peer_count() == 1).await;
        assert_eq!(client.connect_attempts(), 1);

        // Drop the hub side of the connection for an ordinary reason.
        let peer = {
            let mut peers = hub.peers.write();
            let (_, connection) = peers.drain().next().expect("one peer");
            connection
        };
        peer.shutdown();

        wait_for("client to observe the drop", || {
            client.status() == ConnectionStatus::Disconnected
        })
        .await;

        // Exactly one retry is scheduled, after the fixed backoff.
        wait_for("client to reconnect", || {
            client.connect_attempts() == 2
                && client.status() == ConnectionStatus::Connected
                && hub.peer_count() == 1
        })
        .await;
    }

    #[tokio::test]
    async fn test_invalidation_is_terminal() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Content, &hub).await;

        wait_for("client to connect", || hub.peer_count() == 1).await;

        let peer = {
            let mut peers = hub.peers.write();
            let (_, connection) = peers.drain().next().expect("one peer");
            connection
        };
        peer.close_with_reason("Extension context invalidated.");

        wait_for("client to observe invalidation", || {
            client.invalidated.load(Ordering::SeqCst)
        })
        .await;

        // Well past the reconnect delay: no retry was ever scheduled.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.connect_attempts(), 1);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert_eq!(hub.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_dial_schedules_single_retry() {
        // Bind then drop so nothing is listening at the address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let dead_addr = listener.local_addr().expect("local addr");
        drop(listener);

        let reconnect_delay = Duration::from_millis(80);
        let client = Coordinator::builder()
            .context(Context::Panel)
            .options(
                CoordinatorOptions::new()
                    .with_hub_addr(dead_addr)
                    .with_initial_connect_delay(Duration::from_millis(10))
                    .with_reconnect_delay(reconnect_delay),
            )
            .build()
            .await
            .expect("client should build even when the hub is down");

        wait_for("first attempt", || client.connect_attempts() >= 1).await;
        assert_eq!(client.status(), ConnectionStatus::Disconnected);

        // Each failure schedules exactly one retry after the fixed backoff,
        // so a second of failures is bounded by the delay, and retries keep
        // coming.
        let before = client.connect_attempts();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let after = client.connect_attempts();

        assert!(after > before, "no retry was ever scheduled");
        assert!(
            after - before <= 15,
            "retries ignored the {reconnect_delay:?} backoff: {before} -> {after}"
        );
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let dead_addr = listener.local_addr().expect("local addr");
        drop(listener);

        let client = Coordinator::builder()
            .context(Context::Content)
            .options(fast_options(dead_addr))
            .build()
            .await
            .expect("client should build");

        // Best-effort: completes and stamps an ID even with no connection.
        let first = client.send(MessageType::ContentReady, json!({}), None);
        let second = client.send(MessageType::ContentReady, json!({}), None);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_context_reassignment_replaces_connection() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Panel, &hub).await;

        wait_for("client to connect", || hub.peer_count() == 1).await;

        client
            .set_context(Context::Content)
            .await
            .expect("reassignment");

        wait_for("client to reconnect under its new context", || {
            let peers = hub.peers.read();
            peers.len() == 1 && peers.keys().all(|name| name.starts_with("content-"))
        })
        .await;

        assert_eq!(client.context(), Context::Content);
        assert_eq!(client.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_hub_reassigned_to_client_drains_peers() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Panel, &hub).await;

        wait_for("client to connect", || hub.peer_count() == 1).await;

        // Becomes a client of whatever hub its options point at; peers and
        // the listener are discarded.
        hub.set_context(Context::Content)
            .await
            .expect("reassignment");

        assert_eq!(hub.peer_count(), 0);
        assert!(hub.hub_addr().is_none());
        assert_eq!(hub.status(), ConnectionStatus::Disconnected);

        // The orphaned client notices and starts retrying.
        wait_for("client to observe the drop", || {
            client.status() == ConnectionStatus::Disconnected
        })
        .await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = spawn_hub().await;
        let client = spawn_client(Context::Panel, &hub).await;

        wait_for("client to connect", || hub.peer_count() == 1).await;

        let kept = collect(&client, Selector::All);

        let removed: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        let id = client.subscribe(Selector::All, move |message| {
            sink.lock().push(message.clone());
        });
        assert!(client.unsubscribe(id));

        hub.send(MessageType::TestMessage, json!({}), None);

        wait_for("kept subscriber to receive", || kept.lock().len() == 1).await;
        assert!(removed.lock().is_empty());
    }
}
