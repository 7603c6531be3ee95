//! Socket frames for hosts that carry messages over a byte stream.
//!
//! A dialing context opens with one `hello` frame declaring its channel
//! name, then sends `message` frames. The hub answers nothing to `hello`;
//! it simply starts routing.
//!
//! # Format
//!
//! ```json
//! { "frame": "hello", "name": "tab-7:1700000000123" }
//! { "frame": "message", "id": "...", "type": "PING", ... }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identifiers::ChannelName;

use super::Message;

// ============================================================================
// Frame
// ============================================================================

/// One frame on a socket-backed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum Frame {
    /// Handshake naming the channel.
    Hello {
        /// Declared channel name.
        name: ChannelName,
    },

    /// A relayed message.
    Message(Message),
}

impl Frame {
    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] on malformed input.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
