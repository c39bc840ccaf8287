//! Fixed-capacity history buffer.
//!
//! Backs per-task progress history and the classified error history. Storage
//! is allocated once at construction; pushing past capacity evicts the oldest
//! entry instead of growing.

use serde::{Serialize, Serializer};
use std::collections::VecDeque;

/// Bounded FIFO that drops its oldest entry when full.
///
/// # Invariants
/// - `len() <= capacity()`
/// - Iteration order is oldest to newest
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one if the buffer was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> impl Iterator<Item = &T> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_dropped_first() {
        let mut buffer = RingBuffer::new(3);
        for i in 0..3 {
            assert_eq!(buffer.push(i), None);
        }
        assert_eq!(buffer.push(3), Some(0));
        assert_eq!(buffer.push(4), Some(1));
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buffer.len(), buffer.capacity());
        assert_eq!(buffer.latest(), Some(&4));
    }

    #[test]
    fn test_recent_returns_tail_in_order() {
        let mut buffer = RingBuffer::new(10);
        for i in 0..6 {
            buffer.push(i);
        }
        assert_eq!(buffer.recent(2).copied().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(buffer.recent(50).count(), 6);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut buffer = RingBuffer::new(0);
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.latest(), Some(&"b"));
    }

    #[test]
    fn test_serializes_as_sequence() {
        let mut buffer = RingBuffer::new(2);
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);
        assert_eq!(serde_json::to_string(&buffer).unwrap(), "[2,3]");
    }
}
