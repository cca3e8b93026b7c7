//! Reply Expectation Table
//!
//! Before sending any packet that solicits an OK or ERROR, the sender
//! registers its packet id here. Inbound OK/ERROR handlers consult the
//! table and drop anything unsolicited, expired, or replayed. The table
//! is a bounded LRU; under overflow the oldest expectations are evicted.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::{EXPECT_CAPACITY, EXPECT_TTL};

struct Inner {
    deadlines: HashMap<u64, i64>,
    order: VecDeque<u64>,
}

/// Short-lived registry of packet ids awaiting replies
pub struct Expect {
    inner: Mutex<Inner>,
}

impl Expect {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                deadlines: HashMap::with_capacity(EXPECT_CAPACITY),
                order: VecDeque::with_capacity(EXPECT_CAPACITY),
            }),
        }
    }

    /// Register an outgoing packet id that expects a reply
    pub fn sending(&self, packet_id: u64, now: i64) {
        let mut inner = self.inner.lock();
        while inner.order.len() >= EXPECT_CAPACITY {
            if let Some(old) = inner.order.pop_front() {
                inner.deadlines.remove(&old);
            }
        }
        inner.deadlines.insert(packet_id, now + EXPECT_TTL);
        inner.order.push_back(packet_id);
    }

    /// True iff a reply to `packet_id` was solicited and is still fresh.
    /// Retires the entry, so a second reply to the same id is rejected.
    pub fn expecting(&self, packet_id: u64, now: i64) -> bool {
        let mut inner = self.inner.lock();
        match inner.deadlines.remove(&packet_id) {
            Some(deadline) => now <= deadline,
            None => false,
        }
    }

    /// Drop expired entries
    pub fn gc(&self, now: i64) {
        let mut inner = self.inner.lock();
        let Inner { deadlines, order } = &mut *inner;
        deadlines.retain(|_, deadline| now <= *deadline);
        order.retain(|id| deadlines.contains_key(id));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Expect {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_reply_accepted_once() {
        let e = Expect::new();
        e.sending(42, 1000);
        assert!(e.expecting(42, 1001));
        // Retired: a replay of the same correlation is rejected.
        assert!(!e.expecting(42, 1002));
    }

    #[test]
    fn test_unsolicited_rejected() {
        let e = Expect::new();
        assert!(!e.expecting(7, 1000));
    }

    #[test]
    fn test_expiry() {
        let e = Expect::new();
        e.sending(42, 1000);
        assert!(!e.expecting(42, 1000 + EXPECT_TTL + 1));
    }

    #[test]
    fn test_lru_eviction() {
        let e = Expect::new();
        for i in 0..(EXPECT_CAPACITY as u64 + 10) {
            e.sending(i, 1000);
        }
        assert_eq!(e.len(), EXPECT_CAPACITY);
        // The oldest entries were evicted.
        assert!(!e.expecting(0, 1001));
        assert!(e.expecting(EXPECT_CAPACITY as u64 + 9, 1001));
    }

    #[test]
    fn test_gc() {
        let e = Expect::new();
        e.sending(1, 1000);
        e.sending(2, 2000);
        e.gc(1000 + EXPECT_TTL + 1);
        assert_eq!(e.len(), 1);
        assert!(e.expecting(2, 2001));
    }
}
