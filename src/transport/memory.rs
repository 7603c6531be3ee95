//! In-process host.
//!
//! Connects every relay of one process through unbounded queues. Used to
//! embed several contexts in one binary and as the fake host in tests.
//!
//! # Fault injection
//!
//! | Method | Effect |
//! |--------|--------|
//! | [`MemoryHost::refuse_next_opens`] | Next `n` opens fail with a transport error |
//! | [`MemoryHost::fail_posts`] | Posts from the dialing side of a channel fail |
//! | [`MemoryHost::disconnect`] | Drops one channel with a chosen reason |
//! | [`MemoryHost::invalidate`] | Tears the host down; every channel reports [`DisconnectReason::HostInvalidated`] |
//! | [`MemoryHost::deliver`] | Pushes a message to a dialer as if the hub sent it |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::identifiers::{ChannelName, ContextId};
use crate::protocol::Message;

use super::{ChannelEvent, ChannelHandle, ChannelSink, DisconnectReason, Host};

// ============================================================================
// Link
// ============================================================================

/// Shared state of one dialer/hub pair.
struct Link {
    /// Declared channel name.
    name: ChannelName,
    /// Cleared once either side closes.
    active: AtomicBool,
    /// Makes posts from the dialer fail.
    fail_dialer_posts: AtomicBool,
    /// Events towards the dialer.
    to_dialer: mpsc::UnboundedSender<ChannelEvent>,
    /// Events towards the hub.
    to_hub: mpsc::UnboundedSender<ChannelEvent>,
}

impl Link {
    /// Deactivates the link and notifies both ends.
    ///
    /// Returns `false` if it was already down.
    fn shut(&self, reason: &DisconnectReason) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        let _ = self
            .to_dialer
            .send(ChannelEvent::Disconnected(reason.clone()));
        let _ = self.to_hub.send(ChannelEvent::Disconnected(reason.clone()));
        true
    }
}

/// Which end of a link a sink writes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Dialer,
    Hub,
}

/// Write half of one link end.
struct MemorySink {
    link: Arc<Link>,
    side: Side,
    /// Host state, to forget the link on close.
    host: Arc<MemoryInner>,
}

impl ChannelSink for MemorySink {
    fn post(&self, message: &Message) -> Result<()> {
        if !self.link.active.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let peer = match self.side {
            Side::Dialer => {
                if self.link.fail_dialer_posts.load(Ordering::SeqCst) {
                    return Err(Error::transport(format!(
                        "post rejected on {}",
                        self.link.name
                    )));
                }
                &self.link.to_hub
            }
            Side::Hub => &self.link.to_dialer,
        };

        trace!(channel = %self.link.name, id = %message.id, "Memory post");
        peer.send(ChannelEvent::Message(message.clone()))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn is_active(&self) -> bool {
        self.link.active.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.host.forget(&self.link);
        if self.link.shut(&DisconnectReason::Closed) {
            debug!(channel = %self.link.name, side = ?self.side, "Memory channel closed");
        }
    }
}

// ============================================================================
// MemoryHost
// ============================================================================

/// Shared state of a [`MemoryHost`].
#[derive(Default)]
struct MemoryInner {
    /// Accept queue of the current hub.
    listener: Mutex<Option<mpsc::UnboundedSender<ChannelHandle>>>,
    /// Open links by channel name.
    links: Mutex<FxHashMap<ChannelName, Arc<Link>>>,
    /// Opens left to refuse.
    refuse_opens: AtomicUsize,
    /// Total open attempts.
    open_attempts: AtomicUsize,
    /// Host torn down.
    invalidated: AtomicBool,
}

impl MemoryInner {
    /// Drops `link` from the open links unless its name was reused.
    fn forget(&self, link: &Arc<Link>) {
        let mut links = self.links.lock();
        if links.get(&link.name).is_some_and(|open| Arc::ptr_eq(open, link)) {
            links.remove(&link.name);
        }
    }
}

/// In-process channel host.
///
/// Clones share the same hub endpoint; hand one clone to every relay of
/// the process.
#[derive(Clone, Default)]
pub struct MemoryHost {
    inner: Arc<MemoryInner>,
}

impl MemoryHost {
    /// Creates a host with no hub listening.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of `open_channel` calls so far.
    #[inline]
    #[must_use]
    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of links the host still tracks.
    #[inline]
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    /// Returns `true` once [`MemoryHost::invalidate`] was called.
    #[inline]
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::SeqCst)
    }

    /// Returns the names of all active channels declared by `context`.
    #[must_use]
    pub fn channels_for(&self, context: ContextId) -> Vec<ChannelName> {
        self.inner
            .links
            .lock()
            .values()
            .filter(|link| link.active.load(Ordering::SeqCst))
            .filter(|link| link.name.context().ok() == Some(context))
            .map(|link| link.name.clone())
            .collect()
    }

    /// Makes the next `count` opens fail.
    pub fn refuse_next_opens(&self, count: usize) {
        self.inner.refuse_opens.store(count, Ordering::SeqCst);
    }

    /// Makes posts from the dialing side of `name` fail or succeed.
    pub fn fail_posts(&self, name: &ChannelName, fail: bool) {
        if let Some(link) = self.inner.links.lock().get(name) {
            link.fail_dialer_posts.store(fail, Ordering::SeqCst);
        }
    }

    /// Drops one channel, reporting `reason` to both ends.
    ///
    /// Returns `false` if no such active channel exists.
    pub fn disconnect(&self, name: &ChannelName, reason: DisconnectReason) -> bool {
        let link = self.inner.links.lock().remove(name);
        link.is_some_and(|link| link.shut(&reason))
    }

    /// Delivers `message` to the dialer of `name` as if the hub posted it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the channel is not active.
    pub fn deliver(&self, name: &ChannelName, message: Message) -> Result<()> {
        let links = self.inner.links.lock();
        let link = links
            .get(name)
            .filter(|link| link.active.load(Ordering::SeqCst))
            .ok_or(Error::ConnectionClosed)?;
        link.to_dialer
            .send(ChannelEvent::Message(message))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Tears the host down.
    ///
    /// Every channel reports [`DisconnectReason::HostInvalidated`] and every
    /// later open fails with [`Error::HostInvalidated`].
    pub fn invalidate(&self) {
        if self.inner.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }

        let links: Vec<_> = self.inner.links.lock().drain().map(|(_, l)| l).collect();
        for link in &links {
            link.shut(&DisconnectReason::HostInvalidated);
        }
        self.inner.listener.lock().take();

        info!(channels = links.len(), "Memory host invalidated");
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn open_channel(&self, name: &ChannelName) -> Result<ChannelHandle> {
        self.inner.open_attempts.fetch_add(1, Ordering::SeqCst);

        if self.is_invalidated() {
            return Err(Error::HostInvalidated);
        }

        let refused = self
            .inner
            .refuse_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport(format!("open refused for {name}")));
        }

        let listener = self
            .inner
            .listener
            .lock()
            .clone()
            .ok_or_else(|| Error::transport("no hub is listening"))?;

        let (to_dialer, dialer_events) = mpsc::unbounded_channel();
        let (to_hub, hub_events) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            name: name.clone(),
            active: AtomicBool::new(true),
            fail_dialer_posts: AtomicBool::new(false),
            to_dialer,
            to_hub,
        });

        let hub_end = ChannelHandle {
            name: name.clone(),
            sink: Arc::new(MemorySink {
                link: Arc::clone(&link),
                side: Side::Hub,
                host: Arc::clone(&self.inner),
            }),
            events: hub_events,
        };

        listener
            .send(hub_end)
            .map_err(|_| Error::transport("hub stopped listening"))?;

        self.inner.links.lock().insert(name.clone(), Arc::clone(&link));
        debug!(channel = %name, "Memory channel opened");

        Ok(ChannelHandle {
            name: name.clone(),
            sink: Arc::new(MemorySink {
                link,
                side: Side::Dialer,
                host: Arc::clone(&self.inner),
            }),
            events: dialer_events,
        })
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<ChannelHandle>> {
        if self.is_invalidated() {
            return Err(Error::HostInvalidated);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listener.lock().replace(tx);
        debug!("Memory hub listening");
        Ok(rx)
    }

    fn is_invalidated(&self) -> bool {
        MemoryHost::is_invalidated(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
