//! Builder pattern for coordinator construction.
//!
//! Provides a fluent API for configuring and creating [`Coordinator`]
//! instances. The context is required up front: construction replaces the
//! original lazily-initialized singleton, so there is no provisional state
//! before setup runs.
//!
//! # Example
//!
//! ```no_run
//! use extension_bus::{Context, Coordinator};
//!
//! # async fn example() -> extension_bus::Result<()> {
//! let coordinator = Coordinator::builder()
//!     .context(Context::Background)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::Context;

use super::Coordinator;
use super::options::CoordinatorOptions;

// ============================================================================
// CoordinatorBuilder
// ============================================================================

/// Builder for configuring a [`Coordinator`] instance.
///
/// Use [`Coordinator::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct CoordinatorBuilder {
    /// The execution context this coordinator will serve.
    context: Option<Context>,
    /// Timing and address configuration.
    options: Option<CoordinatorOptions>,
}

// ============================================================================
// CoordinatorBuilder Implementation
// ============================================================================

impl CoordinatorBuilder {
    /// Creates a new builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the execution context. Required.
    #[inline]
    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Replaces the options wholesale.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: CoordinatorOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Sets the address the hub binds and clients dial.
    #[inline]
    #[must_use]
    pub fn hub_addr(mut self, addr: SocketAddr) -> Self {
        self.options = Some(self.current_options().with_hub_addr(addr));
        self
    }

    /// Sets the delay before a client's first connection attempt.
    #[inline]
    #[must_use]
    pub fn initial_connect_delay(mut self, delay: Duration) -> Self {
        self.options = Some(self.current_options().with_initial_connect_delay(delay));
        self
    }

    /// Sets the fixed reconnect delay.
    #[inline]
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.options = Some(self.current_options().with_reconnect_delay(delay));
        self
    }

    /// Sets the name-announcement handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options = Some(self.current_options().with_handshake_timeout(timeout));
        self
    }

    /// Builds the coordinator and runs role-appropriate setup.
    ///
    /// A hub is listening when this returns; a client has its first dial
    /// scheduled (a hub that is not up yet is an ordinary recoverable
    /// failure, not a build error).
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no context was set
    /// - [`Error::Io`] if the hub listener cannot bind
    pub async fn build(self) -> Result<Arc<Coordinator>> {
        let context = self.context.ok_or_else(|| {
            Error::config(
                "Context is required. Use .context() to set it.\n\
                 Example: Coordinator::builder().context(Context::Background)",
            )
        })?;
        let options = self.options.unwrap_or_default();

        let coordinator = Arc::new(Coordinator::with_options(context, options));
        let generation = coordinator.current_generation();
        coordinator.setup(generation).await?;

        Ok(coordinator)
    }

    /// Returns the options configured so far.
    fn current_options(&self) -> CoordinatorOptions {
        self.options.clone().unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
