//! Live channels and the hub-side channel registry.
//!
//! A [`LiveChannel`] owns everything one established channel needs: its
//! sink, the identity it was declared under, the link id that tags its
//! events, and the forwarder task pumping those events into the relay
//! loop. Dropping it closes the sink and aborts the forwarder.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::identifiers::{ChannelName, ContextId};
use crate::protocol::Message;
use crate::transport::ChannelSink;

// ============================================================================
// LiveChannel
// ============================================================================

/// One established channel.
pub struct LiveChannel {
    /// Declared name.
    pub name: ChannelName,
    /// Identity recovered from the name.
    pub identity: ContextId,
    /// Tag carried by this channel's loop events.
    pub link: u64,
    /// Write half.
    sink: Arc<dyn ChannelSink>,
    /// Task forwarding channel events to the relay loop.
    forwarder: Option<JoinHandle<()>>,
}

impl fmt::Debug for LiveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveChannel")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("link", &self.link)
            .field("active", &self.is_active())
            .finish()
    }
}

impl LiveChannel {
    /// Wraps an established channel.
    #[must_use]
    pub fn new(
        name: ChannelName,
        identity: ContextId,
        link: u64,
        sink: Arc<dyn ChannelSink>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            name,
            identity,
            link,
            sink,
            forwarder,
        }
    }

    /// Posts one message.
    ///
    /// # Errors
    ///
    /// Propagates the sink's transport error.
    #[inline]
    pub fn post(&self, message: &Message) -> Result<()> {
        self.sink.post(message)
    }

    /// Returns `true` while the sink accepts posts.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.sink.is_active()
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.sink.close();
    }
}

// ============================================================================
// ChannelRegistry
// ============================================================================

/// Channels accepted by the hub, keyed by declared name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: FxHashMap<ChannelName, LiveChannel>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel, replacing any channel with the same name.
    pub fn register(&mut self, channel: LiveChannel) {
        if let Some(previous) = self.channels.insert(channel.name.clone(), channel) {
            debug!(channel = %previous.name, link = previous.link, "Replaced channel with same name");
        }
    }

    /// Removes `name` if it is still the channel tagged `link`.
    ///
    /// Returns the removed channel. A stale link (already replaced) leaves
    /// the registry untouched.
    pub fn remove(&mut self, name: &ChannelName, link: u64) -> Option<LiveChannel> {
        if self.channels.get(name).is_some_and(|c| c.link == link) {
            self.channels.remove(name)
        } else {
            None
        }
    }

    /// Returns the channel `name` if it is tagged `link`.
    #[must_use]
    pub fn get(&self, name: &ChannelName, link: u64) -> Option<&LiveChannel> {
        self.channels.get(name).filter(|c| c.link == link)
    }

    /// Returns a registered channel by name.
    #[must_use]
    pub fn by_name(&self, name: &ChannelName) -> Option<&LiveChannel> {
        self.channels.get(name)
    }

    /// Iterates registered channels.
    pub fn iter(&self) -> impl Iterator<Item = &LiveChannel> {
        self.channels.values()
    }

    /// Number of registered channels.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns `true` if no channel is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drops every channel. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.channels.len();
        self.channels.clear();
        count
    }
}

// ============================================================================
// Tests
// ============================================================================
