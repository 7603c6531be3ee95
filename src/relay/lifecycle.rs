//! Connection state machine.
//!
//! ```text
//! Idle ──► Connecting ──► Connected ──► Disconnected ──► Connecting
//!  │           │              │              │
//!  │           └──────────► Invalidated ◄────┘
//!  └──► Listening (hub) ──────────┘
//! ```
//!
//! `Invalidated` is terminal: no transition leaves it. Only an identity
//! reassignment starts a fresh machine through [`Lifecycle::reset`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, warn};

// ============================================================================
// ConnectionState
// ============================================================================

/// Connection state of a relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No identity, or not started.
    #[default]
    Idle,
    /// Waiting for the connect delay or for the channel to open.
    Connecting,
    /// Outbound channel established.
    Connected,
    /// Channel lost; a reconnect is pending.
    Disconnected,
    /// Hub accept loop running.
    Listening,
    /// Host torn down. Terminal.
    Invalidated,
}

impl ConnectionState {
    /// Returns `true` if `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Listening)
                | (Idle, Invalidated)
                | (Listening, Invalidated)
                | (Connecting, Connected)
                | (Connecting, Invalidated)
                | (Connected, Disconnected)
                | (Connected, Invalidated)
                | (Disconnected, Connecting)
                | (Disconnected, Invalidated)
        )
    }

    /// Returns `true` for the terminal state.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Invalidated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Listening => "listening",
            Self::Invalidated => "invalidated",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Current state plus a watch channel publishing every change.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    publisher: watch::Sender<ConnectionState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Creates a machine in [`ConnectionState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            publisher: watch::Sender::new(ConnectionState::Idle),
        }
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.subscribe()
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// Staying in the same state is a no-op that returns `true`.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return true;
        }

        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Rejected state transition");
            return false;
        }

        debug!(from = %self.state, to = %next, "State transition");
        self.set(next);
        true
    }

    /// Returns to [`ConnectionState::Idle`] for a new identity.
    pub fn reset(&mut self) {
        if self.state != ConnectionState::Idle {
            debug!(from = %self.state, "State reset");
            self.set(ConnectionState::Idle);
        }
    }

    fn set(&mut self, next: ConnectionState) {
        self.state = next;
        self.publisher.send_replace(next);
    }
}

// ============================================================================
// Tests
// ============================================================================
