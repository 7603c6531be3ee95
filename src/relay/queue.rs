//! Outbound queue for messages awaiting a live channel.
//!
//! FIFO and unbounded. A flush posts from the head; the first failing post
//! puts its message back at the head and stops, so nothing is reordered or
//! lost.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::protocol::Message;

// ============================================================================
// FlushReport
// ============================================================================

/// Result of one flush.
#[derive(Debug)]
pub struct FlushReport {
    /// Messages posted successfully.
    pub posted: usize,
    /// Messages still queued.
    pub remaining: usize,
    /// The post failure that stopped the flush, if any.
    pub error: Option<Error>,
}

impl FlushReport {
    /// Returns `true` if the queue was drained.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

// ============================================================================
// PendingQueue
// ============================================================================

/// Ordered list of outbound messages.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<Message>,
}

impl PendingQueue {
    /// Creates an empty queue.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    #[inline]
    pub fn push(&mut self, message: Message) {
        self.items.push_back(message);
    }

    /// Number of queued messages.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates queued messages in send order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    /// Drops every queued message. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    /// Posts queued messages in order until one fails.
    pub fn flush<F>(&mut self, mut post: F) -> FlushReport
    where
        F: FnMut(&Message) -> Result<()>,
    {
        let mut posted = 0;
        let mut error = None;

        while let Some(message) = self.items.pop_front() {
            if let Err(e) = post(&message) {
                self.items.push_front(message);
                error = Some(e);
                break;
            }
            posted += 1;
        }

        FlushReport {
            posted,
            remaining: self.items.len(),
            error,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::identifiers::ContextId;
    use crate::protocol::MessageType;

    fn numbered(n: usize) -> Message {
        Message::new(
            MessageType::StyleChanged,
            json!({ "seq": n }),
            ContextId::Panel,
            None,
        )
    }

    fn seq(message: &Message) -> u64 {
        message.payload["seq"].as_u64().unwrap_or(u64::MAX)
    }

    #[test]
    fn test_flush_in_order() {
        let mut queue = PendingQueue::new();
        for n in 0..3 {
            queue.push(numbered(n));
        }

        let mut seen = Vec::new();
        let report = queue.flush(|m| {
            seen.push(seq(m));
            Ok(())
        });

        assert!(report.is_complete());
        assert_eq!(report.posted, 3);
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mid_flush_failure_keeps_failed_at_head() {
        let mut queue = PendingQueue::new();
        for n in 0..4 {
            queue.push(numbered(n));
        }

        let report = queue.flush(|m| {
            if seq(m) == 2 {
                Err(Error::ConnectionClosed)
            } else {
                Ok(())
            }
        });

        assert_eq!(report.posted, 2);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.error, Some(Error::ConnectionClosed)));

        let left: Vec<_> = queue.iter().map(seq).collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[test]
    fn test_clear_reports_dropped() {
        let mut queue = PendingQueue::new();
        queue.push(numbered(0));
        queue.push(numbered(1));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_flush_preserves_order_across_failures(
            count in 0usize..40,
            fail_at in proptest::collection::vec(0usize..40, 0..5),
        ) {
            let mut queue = PendingQueue::new();
            for n in 0..count {
                queue.push(numbered(n));
            }

            // Each listed position fails once, then succeeds on a later flush.
            let mut pending_failures = fail_at.clone();
            let mut delivered = Vec::new();
            let mut attempts = 0usize;

            while !queue.is_empty() {
                let report = queue.flush(|m| {
                    let n = seq(m) as usize;
                    if let Some(pos) = pending_failures.iter().position(|f| *f == n) {
                        pending_failures.remove(pos);
                        return Err(Error::transport("injected"));
                    }
                    delivered.push(n);
                    Ok(())
                });
                prop_assert_eq!(report.remaining, queue.len());
                attempts += 1;
                prop_assert!(attempts <= count + fail_at.len() + 1);
            }

            prop_assert_eq!(delivered, (0..count).collect::<Vec<_>>());
        }
    }
}
