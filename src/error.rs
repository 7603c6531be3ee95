//! Error types for the context relay.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use context_relay::{ContextId, MessageType, Result};
//!
//! async fn example(relay: &context_relay::Relay) -> Result<()> {
//!     relay.set_identity(ContextId::Panel).await?;
//!     relay.send(MessageType::Ping, serde_json::Value::Null, None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidContextId`] |
//! | Transport | [`Error::Transport`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Lifecycle | [`Error::HostInvalidated`], [`Error::Invalidated`], [`Error::IdentityUnassigned`], [`Error::RelayClosed`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |
//!
//! A target that is not registered at the hub is not an error: the message
//! is dropped and logged.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when relay or host configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Context id string could not be parsed.
    #[error("Invalid context id: {value}")]
    InvalidContextId {
        /// The rejected input.
        value: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Channel failed to open or a post failed.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Timed out waiting for the peer.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Channel closed underneath a post.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The hosting process reported teardown.
    ///
    /// Fatal for the relay instance: no reconnect is ever scheduled again.
    #[error("Host invalidated")]
    HostInvalidated,

    /// The relay instance reached its terminal state.
    #[error("Relay invalidated; identity {context} can no longer send")]
    Invalidated {
        /// Identity at the time of invalidation.
        context: String,
    },

    /// No identity has been adopted yet.
    #[error("No identity assigned; call set_identity first")]
    IdentityUnassigned,

    /// The relay event loop has stopped.
    #[error("Relay closed")]
    RelayClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid context id error.
    #[inline]
    pub fn invalid_context_id(value: impl Into<String>) -> Self {
        Self::InvalidContextId {
            value: value.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an invalidated error for the given identity.
    #[inline]
    pub fn invalidated(context: impl ToString) -> Self {
        Self::Invalidated {
            context: context.to_string(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a transport-level failure.
    ///
    /// Transport failures are retried by the relay and never reach
    /// subscribers.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` if the relay can never recover from this error.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::HostInvalidated | Self::Invalidated { .. } | Self::RelayClosed
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_transport_error() && !self.is_terminal()
    }
}

// ============================================================================
// Tests
// ============================================================================
