//! Relay timing configuration.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay before the first connect attempt after adopting an identity.
pub const DEFAULT_INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a processed message id is remembered.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(30);

/// Interval of the expired-id sweep.
pub const DEFAULT_DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// RelayConfig
// ============================================================================

/// Timing knobs of a relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Delay before the first connect attempt.
    pub initial_connect_delay: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Dedup window.
    pub dedup_ttl: Duration,
    /// Sweep interval for expired ids.
    pub dedup_sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            initial_connect_delay: DEFAULT_INITIAL_CONNECT_DELAY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_sweep_interval: DEFAULT_DEDUP_SWEEP_INTERVAL,
        }
    }
}

impl RelayConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the dedup TTL, the sweep interval or
    /// the reconnect delay is zero.
    pub fn validate(&self) -> Result<()> {
        if self.dedup_ttl.is_zero() {
            return Err(Error::config("dedup_ttl must be non-zero"));
        }
        if self.dedup_sweep_interval.is_zero() {
            return Err(Error::config("dedup_sweep_interval must be non-zero"));
        }
        if self.reconnect_delay.is_zero() {
            return Err(Error::config(
                "reconnect_delay must be non-zero; a zero delay would spin on a dead hub",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
