//! Time-bounded set of processed message ids.
//!
//! An id is remembered for a fixed TTL after it is first recorded. Within
//! that window a second delivery of the same id is reported as a duplicate;
//! afterwards the id is forgotten to bound memory.
//!
//! Time is passed in by the caller so the relay loop and tests share one
//! clock (`tokio::time::Instant`, which follows paused test time).

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::identifiers::MessageId;

// ============================================================================
// ProcessedIds
// ============================================================================

/// Recently seen message ids with expiry.
#[derive(Debug)]
pub struct ProcessedIds {
    /// How long an id is remembered.
    ttl: Duration,
    /// Id -> expiry deadline.
    seen: FxHashMap<MessageId, Instant>,
    /// Expiry order. Deadlines are non-decreasing because `ttl` is fixed.
    expiry: VecDeque<(Instant, MessageId)>,
}

impl ProcessedIds {
    /// Creates an empty set with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: FxHashMap::default(),
            expiry: VecDeque::new(),
        }
    }

    /// Returns the configured TTL.
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records `id` if it is new.
    ///
    /// Returns `true` on first sight within the TTL window, `false` for a
    /// duplicate.
    pub fn check_and_record(&mut self, id: MessageId, now: Instant) -> bool {
        self.evict_expired(now);

        if self.seen.contains_key(&id) {
            return false;
        }

        let deadline = now + self.ttl;
        self.seen.insert(id.clone(), deadline);
        self.expiry.push_back((deadline, id));
        true
    }

    /// Returns `true` if `id` is remembered at `now`.
    #[must_use]
    pub fn contains(&self, id: &MessageId, now: Instant) -> bool {
        self.seen.get(id).is_some_and(|deadline| *deadline > now)
    }

    /// Forgets every id whose TTL elapsed. Returns how many were dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while self.expiry.front().is_some_and(|(deadline, _)| *deadline <= now) {
            if let Some((_, id)) = self.expiry.pop_front() {
                self.seen.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of ids currently remembered.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns `true` if nothing is remembered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.expiry.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_duplicate_within_ttl() {
        let mut ids = ProcessedIds::new(TTL);
        let now = Instant::now();
        let id = MessageId::generate();

        assert!(ids.check_and_record(id.clone(), now));
        assert!(!ids.check_and_record(id.clone(), now + Duration::from_secs(29)));
        assert!(ids.contains(&id, now));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_id_forgotten_after_ttl() {
        let mut ids = ProcessedIds::new(TTL);
        let now = Instant::now();
        let id = MessageId::generate();

        assert!(ids.check_and_record(id.clone(), now));
        assert!(!ids.contains(&id, now + TTL));
        assert!(ids.check_and_record(id, now + TTL));
    }

    #[test]
    fn test_evict_expired_in_order() {
        let mut ids = ProcessedIds::new(TTL);
        let start = Instant::now();

        for offset in 0..5 {
            ids.check_and_record(MessageId::generate(), start + Duration::from_secs(offset));
        }

        assert_eq!(ids.evict_expired(start + TTL + Duration::from_secs(2)), 3);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.evict_expired(start + TTL * 2), 2);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut ids = ProcessedIds::new(TTL);
        let now = Instant::now();
        let id = MessageId::generate();

        ids.check_and_record(id.clone(), now);
        ids.clear();
        assert!(ids.is_empty());
        assert!(ids.check_and_record(id, now));
    }
}
