//! Coordinator configuration options.
//!
//! The relay's timing constants are deliberately configuration, not
//! constants: the ~100ms initial-connect delay and ~1s reconnect delay are
//! untuned values carried over from observed behavior, and tests shorten
//! them rather than waiting out real backoffs.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use extension_bus::CoordinatorOptions;
//!
//! let options = CoordinatorOptions::new()
//!     .with_reconnect_delay(Duration::from_millis(500));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default port the hub listens on.
pub const DEFAULT_HUB_PORT: u16 = 8765;

/// Default delay before a client's first connection attempt.
///
/// Gives the hub's accepting end time to finish initializing.
pub const DEFAULT_INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Default fixed delay between a disconnect and the single retry.
///
/// Constant rather than exponential: the failure domain is a handful of
/// long-lived sibling contexts on the same machine, not a remote network.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default timeout for the name-announcement handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// CoordinatorOptions
// ============================================================================

/// Configuration for a [`crate::Coordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Address the hub binds and clients dial.
    ///
    /// Use port 0 on the hub to bind a random port, then read the actual
    /// address back via `Coordinator::hub_addr`.
    pub hub_addr: SocketAddr,

    /// Delay before a client's first connection attempt.
    pub initial_connect_delay: Duration,

    /// Fixed delay between a disconnect and the single scheduled retry.
    pub reconnect_delay: Duration,

    /// How long the hub waits for a new connection to announce its name.
    pub handshake_timeout: Duration,
}

impl CoordinatorOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hub_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_HUB_PORT),
            initial_connect_delay: DEFAULT_INITIAL_CONNECT_DELAY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Sets the hub address.
    #[inline]
    #[must_use]
    pub const fn with_hub_addr(mut self, addr: SocketAddr) -> Self {
        self.hub_addr = addr;
        self
    }

    /// Sets the delay before a client's first connection attempt.
    #[inline]
    #[must_use]
    pub const fn with_initial_connect_delay(mut self, delay: Duration) -> Self {
        self.initial_connect_delay = delay;
        self
    }

    /// Sets the fixed reconnect delay.
    #[inline]
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the name-announcement handshake timeout.
    #[inline]
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CoordinatorOptions::new();
        assert_eq!(options.hub_addr.port(), DEFAULT_HUB_PORT);
        assert!(options.hub_addr.ip().is_loopback());
        assert_eq!(options.initial_connect_delay, Duration::from_millis(100));
        assert_eq!(options.reconnect_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_setters() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        let options = CoordinatorOptions::new()
            .with_hub_addr(addr)
            .with_initial_connect_delay(Duration::from_millis(5))
            .with_reconnect_delay(Duration::from_millis(50))
            .with_handshake_timeout(Duration::from_secs(2));

        assert_eq!(options.hub_addr, addr);
        assert_eq!(options.initial_connect_delay, Duration::from_millis(5));
        assert_eq!(options.reconnect_delay, Duration::from_millis(50));
        assert_eq!(options.handshake_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_default_trait_matches_new() {
        assert_eq!(CoordinatorOptions::default(), CoordinatorOptions::new());
    }
}
