//! Host channel transports.
//!
//! The relay never touches sockets directly. It talks to a [`Host`], the
//! channel primitive supplied by the hosting environment, which opens named
//! channels towards the hub and lets the hub accept inbound ones.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Tab / Panel    │        ChannelHandle         │  Hub            │
//! │                 │                              │                 │
//! │  Host::open ────┼─────────────────────────────►│  Host::listen   │
//! │  ChannelSink    │◄────── ChannelEvent ────────►│  ChannelSink    │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Channel Lifecycle
//!
//! 1. `Host::open_channel` - Dial the hub with a declared channel name
//! 2. `Host::listen` - Hub receives one [`ChannelHandle`] per dialer
//! 3. `ChannelSink::post` - Non-blocking send of one message
//! 4. `ChannelEvent::Disconnected` - Last event of every channel
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process host with fault injection |
//! | `connection` | Event loop serving one WebSocket |
//! | `server` | WebSocket accept loop and handshake |
//! | `websocket` | WebSocket [`Host`] implementation |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identifiers::ChannelName;
use crate::protocol::Message;

// ============================================================================
// Submodules
// ============================================================================

/// Event loop serving one WebSocket channel.
pub mod connection;

/// In-process host.
pub mod memory;

/// WebSocket server for hub-side accepts.
pub mod server;

/// WebSocket host.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::MemoryHost;
pub use websocket::WebSocketHost;

// ============================================================================
// Constants
// ============================================================================

/// Close reason a host uses to report that its process was torn down.
pub const HOST_INVALIDATED_REASON: &str = "host invalidated";

// ============================================================================
// Types
// ============================================================================

/// Why a channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the channel normally.
    Closed,
    /// The hosting process itself was torn down. Terminal.
    HostInvalidated,
    /// Transport failure.
    Error(String),
}

impl DisconnectReason {
    /// Returns `true` if the reason forbids any further reconnect.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HostInvalidated)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::HostInvalidated => f.write_str(HOST_INVALIDATED_REASON),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Event delivered by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A message arrived.
    Message(Message),
    /// The channel closed. No event follows.
    Disconnected(DisconnectReason),
}

/// Write half of a channel.
pub trait ChannelSink: Send + Sync {
    /// Posts one message without waiting for the peer.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::ConnectionClosed`] if the channel is gone
    /// - [`crate::Error::Transport`] if the host rejected the post
    fn post(&self, message: &Message) -> Result<()>;

    /// Returns `true` while posts can still succeed.
    fn is_active(&self) -> bool;

    /// Closes the channel from this side.
    fn close(&self);
}

/// One end of an established channel.
pub struct ChannelHandle {
    /// Declared channel name.
    pub name: ChannelName,
    /// Write half.
    pub sink: Arc<dyn ChannelSink>,
    /// Read half, ending with [`ChannelEvent::Disconnected`].
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("active", &self.sink.is_active())
            .finish_non_exhaustive()
    }
}

/// Channel primitive supplied by the hosting environment.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Opens an outbound channel to the hub.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::HostInvalidated`] if the host was torn down
    /// - [`crate::Error::Transport`] or [`crate::Error::ConnectionTimeout`] on failure
    async fn open_channel(&self, name: &ChannelName) -> Result<ChannelHandle>;

    /// Starts accepting inbound channels (hub only).
    ///
    /// Dropping the returned receiver stops accepting. The host closes it
    /// when it is torn down.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot listen.
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<ChannelHandle>>;

    /// Returns `true` once the host was torn down for good.
    fn is_invalidated(&self) -> bool {
        false
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_terminal() {
        assert!(DisconnectReason::HostInvalidated.is_terminal());
        assert!(!DisconnectReason::Closed.is_terminal());
        assert!(!DisconnectReason::Error("reset".into()).is_terminal());
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::HostInvalidated.to_string(),
            HOST_INVALIDATED_REASON
        );
        assert_eq!(
            DisconnectReason::Error("reset".into()).to_string(),
            "error: reset"
        );
    }
}
