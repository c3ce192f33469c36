//! Priority queue with per-item expiry.
//!
//! Items are ordered by ascending priority (smaller runs earlier), ties
//! broken by insertion order. Expired items are dropped lazily on
//! dequeue/peek and in bulk by `clean_expired`.

use std::time::{Duration, Instant};

struct Entry<T> {
    item: T,
    priority: i32,
    expiry: Instant,
    seq: u64,
}

/// Stable, priority-ordered container of items with a time-to-live.
pub struct ExpiringQueue<T> {
    entries: Vec<Entry<T>>,
    next_seq: u64,
}

impl<T> ExpiringQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Insert an item that expires `ttl` from now. Keeps the vector sorted
    /// by (priority, insertion order); fine up to a few thousand pending
    /// items.
    pub fn enqueue(&mut self, item: T, priority: i32, ttl: Duration) {
        let entry = Entry {
            item,
            priority,
            expiry: Instant::now() + ttl,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let idx = self.entries.partition_point(|e| e.priority <= priority);
        self.entries.insert(idx, entry);
    }

    /// Remove and return the first item still alive, discarding any expired
    /// entries ahead of it.
    pub fn dequeue(&mut self) -> Option<T> {
        let now = Instant::now();
        while !self.entries.is_empty() {
            let entry = self.entries.remove(0);
            if now < entry.expiry {
                return Some(entry.item);
            }
        }
        None
    }

    /// The first live item without removing it. Expired entries ahead of it
    /// are still discarded.
    pub fn peek(&mut self) -> Option<&T> {
        let now = Instant::now();
        while let Some(entry) = self.entries.first() {
            if now < entry.expiry {
                break;
            }
            self.entries.remove(0);
        }
        self.entries.first().map(|e| &e.item)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn clean_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|e| now < e.expiry);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current entry count, including expired entries not yet filtered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ExpiringQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn fifo_within_equal_priority() {
        let mut q = ExpiringQueue::new();
        q.enqueue("a", 0, LONG);
        q.enqueue("b", 0, LONG);
        q.enqueue("c", 0, LONG);

        assert_eq!(q.dequeue(), Some("a"));
        assert_eq!(q.dequeue(), Some("b"));
        assert_eq!(q.dequeue(), Some("c"));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn lower_priority_value_dequeues_first() {
        let mut q = ExpiringQueue::new();
        q.enqueue("later", 5, LONG);
        q.enqueue("first", 0, LONG);
        q.enqueue("middle", 2, LONG);

        assert_eq!(q.dequeue(), Some("first"));
        assert_eq!(q.dequeue(), Some("middle"));
        assert_eq!(q.dequeue(), Some("later"));
    }

    #[test]
    fn expired_items_are_skipped_on_dequeue() {
        let mut q = ExpiringQueue::new();
        q.enqueue("stale", 0, Duration::ZERO);
        q.enqueue("fresh", 0, LONG);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.dequeue(), Some("fresh"));
        assert!(q.is_empty());
    }

    #[test]
    fn peek_discards_leading_expired_without_consuming_live() {
        let mut q = ExpiringQueue::new();
        q.enqueue("stale", 0, Duration::ZERO);
        q.enqueue("fresh", 1, LONG);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.peek(), Some(&"fresh"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue(), Some("fresh"));
    }

    #[test]
    fn clean_expired_is_idempotent() {
        let mut q = ExpiringQueue::new();
        q.enqueue("a", 0, Duration::ZERO);
        q.enqueue("b", 0, Duration::ZERO);
        q.enqueue("keep", 0, LONG);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.clean_expired(), 2);
        assert_eq!(q.clean_expired(), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn len_counts_expired_until_filtered() {
        let mut q = ExpiringQueue::new();
        q.enqueue("a", 0, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.len(), 1);
        q.clean_expired();
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn clear_empties_everything() {
        let mut q = ExpiringQueue::new();
        q.enqueue("a", 0, LONG);
        q.enqueue("b", 1, LONG);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }
}
