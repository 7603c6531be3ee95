//! Builder pattern for relay configuration.
//!
//! # Example
//!
//! ```no_run
//! use context_relay::{ContextId, Relay};
//! use context_relay::transport::MemoryHost;
//!
//! # async fn example() -> context_relay::Result<()> {
//! let relay = Relay::builder()
//!     .host(MemoryHost::new())
//!     .identity(ContextId::Panel)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::error::{Error, Result};
use crate::identifiers::ContextId;
use crate::transport::Host;

use super::config::RelayConfig;
use super::core::Relay;

// ============================================================================
// RelayBuilder
// ============================================================================

/// Builder for configuring a [`Relay`] instance.
///
/// Use [`Relay::builder()`] to create a new builder.
#[derive(Clone, Default)]
pub struct RelayBuilder {
    /// Channel host.
    host: Option<Arc<dyn Host>>,
    /// Identity adopted at startup.
    identity: ContextId,
    /// Timing configuration.
    config: RelayConfig,
}

impl fmt::Debug for RelayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("host", &self.host.is_some())
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// RelayBuilder Implementation
// ============================================================================

impl RelayBuilder {
    /// Creates a builder with no host and no identity.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the channel host.
    #[inline]
    #[must_use]
    pub fn host(mut self, host: impl Host) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    /// Sets a shared channel host.
    #[inline]
    #[must_use]
    pub fn shared_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Sets the identity adopted at startup.
    ///
    /// Defaults to [`ContextId::Unassigned`]; adopt one later with
    /// [`Relay::set_identity`].
    #[inline]
    #[must_use]
    pub fn identity(mut self, identity: ContextId) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the delay before the first connect attempt.
    #[inline]
    #[must_use]
    pub fn initial_connect_delay(mut self, delay: Duration) -> Self {
        self.config.initial_connect_delay = delay;
        self
    }

    /// Sets the delay between reconnect attempts.
    #[inline]
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Sets how long processed message ids are remembered.
    #[inline]
    #[must_use]
    pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
        self.config.dedup_ttl = ttl;
        self
    }

    /// Sets the sweep interval for expired ids.
    #[inline]
    #[must_use]
    pub fn dedup_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.dedup_sweep_interval = interval;
        self
    }

    /// Replaces the whole timing configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the relay and starts its event loop.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no host is set
    /// - [`Error::Config`] if the timing configuration is invalid
    /// - [`Error::Config`] if called outside a tokio runtime
    pub fn build(self) -> Result<Relay> {
        let host = self.host.ok_or_else(|| {
            Error::config(
                "A channel host is required. Use .host() to set it.\n\
                 Example: Relay::builder().host(MemoryHost::new())",
            )
        })?;

        self.config.validate()?;

        let runtime = Handle::try_current()
            .map_err(|_| Error::config("Relay::build must be called inside a tokio runtime"))?;

        Ok(Relay::spawn(&runtime, host, self.identity, self.config))
    }
}

// ============================================================================
// Tests
// ============================================================================
