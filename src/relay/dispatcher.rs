//! Local publish/subscribe fan-out.
//!
//! Handlers for one [`Topic`] run in registration order. Handlers for
//! [`Topic::All`] run after the type-specific ones. Dispatch walks a
//! snapshot taken when it starts, so a handler may subscribe or unsubscribe
//! (itself included) without disturbing the current dispatch.
//!
//! A panicking handler is logged and skipped; the rest still run.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::protocol::{Message, MessageType};

// ============================================================================
// Types
// ============================================================================

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// One message kind.
    Kind(MessageType),
    /// Every message, after the kind-specific handlers.
    All,
}

impl From<MessageType> for Topic {
    fn from(kind: MessageType) -> Self {
        Self::Kind(kind)
    }
}

/// Registered handler with its removal key.
struct Entry {
    id: u64,
    handler: Handler,
}

/// Handler table.
#[derive(Default)]
struct Table {
    next_id: u64,
    topics: FxHashMap<Topic, Vec<Entry>>,
}

impl Table {
    /// Removes one handler; returns `true` if it was present.
    fn remove(&mut self, topic: Topic, id: u64) -> bool {
        let Some(entries) = self.topics.get_mut(&topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.topics.remove(&topic);
        }
        removed
    }

    /// Clones the handlers that must see `kind`, wildcard last.
    fn snapshot(&self, kind: MessageType) -> Vec<Handler> {
        let specific = self.topics.get(&Topic::Kind(kind)).into_iter().flatten();
        let wildcard = self.topics.get(&Topic::All).into_iter().flatten();
        specific
            .chain(wildcard)
            .map(|entry| Arc::clone(&entry.handler))
            .collect()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Subscription registry and fan-out.
///
/// Cloning shares the same handler table.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: Arc<Mutex<Table>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Dispatcher")
            .field("topics", &table.topics.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.topics.entry(topic).or_default().push(Entry {
            id,
            handler: Arc::new(handler),
        });

        trace!(?topic, id, "Handler subscribed");

        Subscription {
            id,
            topic,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Returns the number of handlers registered for `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: impl Into<Topic>) -> usize {
        self.table
            .lock()
            .topics
            .get(&topic.into())
            .map_or(0, Vec::len)
    }

    /// Fans `message` out to its handlers.
    ///
    /// Returns the number of handlers invoked, panicked ones included.
    pub fn dispatch(&self, message: &Message) -> usize {
        // Lock is released before any handler runs.
        let handlers = self.table.lock().snapshot(message.kind);

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(
                    id = %message.id,
                    kind = %message.kind,
                    source = %message.source,
                    "Message handler panicked"
                );
            }
        }

        handlers.len()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned by [`Dispatcher::subscribe`].
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    topic: Topic,
    table: Weak<Mutex<Table>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

impl Subscription {
    /// Returns the topic this subscription listens to.
    #[inline]
    #[must_use]
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Removes the handler.
    ///
    /// Returns `false` if it was already removed or the dispatcher is gone.
    pub fn unsubscribe(&self) -> bool {
        self.table
            .upgrade()
            .is_some_and(|table| table.lock().remove(self.topic, self.id))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::identifiers::ContextId;
    use serde_json::Value;

    fn message(kind: MessageType) -> Message {
        Message::new(kind, Value::Null, ContextId::Hub, None)
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;
    type BoxedHandler = Box<dyn Fn(&Message) + Send + Sync>;

    /// Returns a shared log and a factory of handlers appending to it.
    fn recorder() -> (Log, impl Fn(&'static str) -> BoxedHandler + Clone + Send + Sync + 'static) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |label: &'static str| -> BoxedHandler {
                let log = Arc::clone(&log);
                Box::new(move |_: &Message| log.lock().push(label))
            }
        };
        (log, make)
    }

    #[test]
    fn test_registration_order_then_wildcard() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(Topic::All, make("all"));
        dispatcher.subscribe(MessageType::Ping, make("first"));
        dispatcher.subscribe(MessageType::Ping, make("second"));
        dispatcher.subscribe(MessageType::Pong, make("pong"));

        assert_eq!(dispatcher.dispatch(&message(MessageType::Ping)), 3);
        assert_eq!(*log.lock(), vec!["first", "second", "all"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        let a = dispatcher.subscribe(MessageType::Ping, make("a"));
        dispatcher.subscribe(MessageType::Ping, make("b"));

        assert!(a.unsubscribe());
        assert!(!a.unsubscribe());
        assert_eq!(dispatcher.handler_count(MessageType::Ping), 1);

        dispatcher.dispatch(&message(MessageType::Ping));
        assert_eq!(*log.lock(), vec!["b"]);
    }

    #[test]
    fn test_no_handlers_is_noop() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(&message(MessageType::TabClosed)), 0);
    }

    #[test]
    fn test_reentrant_unsubscribe_uses_snapshot() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let first = {
            let slot = Arc::clone(&slot);
            let log = Arc::clone(&log);
            dispatcher.subscribe(MessageType::Ping, move |_| {
                log.lock().push("first");
                if let Some(sub) = slot.lock().take() {
                    sub.unsubscribe();
                }
            })
        };
        let second = dispatcher.subscribe(MessageType::Ping, make("second"));
        *slot.lock() = Some(second);

        // The snapshot still holds "second" for this dispatch.
        dispatcher.dispatch(&message(MessageType::Ping));
        assert_eq!(*log.lock(), vec!["first", "second"]);

        dispatcher.dispatch(&message(MessageType::Ping));
        assert_eq!(*log.lock(), vec!["first", "second", "first"]);
        assert!(first.unsubscribe());
    }

    #[test]
    fn test_reentrant_subscribe_applies_next_dispatch() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        let inner = dispatcher.clone();
        let make_late = make.clone();
        dispatcher.subscribe(MessageType::Ping, move |_| {
            inner.subscribe(MessageType::Ping, make_late("late"));
        });

        dispatcher.dispatch(&message(MessageType::Ping));
        assert!(log.lock().is_empty());

        dispatcher.dispatch(&message(MessageType::Ping));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(MessageType::Ping, |_| panic!("handler bug"));
        dispatcher.subscribe(MessageType::Ping, make("after"));

        assert_eq!(dispatcher.dispatch(&message(MessageType::Ping)), 2);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_unsubscribe_after_dispatcher_dropped() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe(Topic::All, |_| {});
        drop(dispatcher);
        assert!(!sub.unsubscribe());
    }
}
