use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 20;
/// Largest window a buffer will hold. Every snapshot copies the whole window.
pub const MAX_HISTORY_CAPACITY: usize = 1000;

/// A fixed-capacity sliding window that keeps the most recent points in arrival order.
///
/// Points are only ever removed from the head, and only when an append pushes the
/// window over capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBuffer<T> {
    points: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> HistoryBuffer<T> {
    /// Creates an empty window. The capacity is clamped to `1..=MAX_HISTORY_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_HISTORY_CAPACITY);
        Self {
            points: VecDeque::with_capacity(capacity.saturating_add(1)),
            capacity,
        }
    }

    /// Adds a point to the tail, dropping the oldest points while over capacity.
    pub fn append(&mut self, point: T) {
        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    /// Returns an owned copy of the window, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.points.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.points.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> Default for HistoryBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_history_buffer() {
        let buffer: HistoryBuffer<f64> = HistoryBuffer::default();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), DEFAULT_HISTORY_CAPACITY);
        assert_eq!(buffer.latest(), None);
    }

    #[test]
    fn test_append_within_capacity() {
        let mut buffer = HistoryBuffer::new(5);
        buffer.append(1);
        buffer.append(2);
        buffer.append(3);
        assert_eq!(buffer.snapshot(), vec![1, 2, 3]);
        assert_eq!(buffer.latest(), Some(&3));
    }

    #[test]
    fn test_fill_window() {
        let mut buffer = HistoryBuffer::new(DEFAULT_HISTORY_CAPACITY);
        for i in 0..DEFAULT_HISTORY_CAPACITY {
            buffer.append(i);
        }
        assert_eq!(buffer.len(), DEFAULT_HISTORY_CAPACITY);
        assert_eq!(buffer.iter().next(), Some(&0));
    }

    #[test]
    fn test_rolling_behavior_drops_oldest_first() {
        let mut buffer = HistoryBuffer::new(DEFAULT_HISTORY_CAPACITY);
        for i in 0..100 {
            buffer.append(i);
            assert!(buffer.len() <= DEFAULT_HISTORY_CAPACITY);
        }

        // Exactly the most recent 20, in arrival order
        let expected: Vec<i32> = (80..100).collect();
        assert_eq!(buffer.snapshot(), expected);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut buffer = HistoryBuffer::new(3);
        buffer.append("a");
        buffer.append("b");

        let mut copy = buffer.snapshot();
        copy.push("c");

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.snapshot(), vec!["a", "b"]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut buffer = HistoryBuffer::new(0);
        buffer.append(1.0);
        buffer.append(2.0);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.snapshot(), vec![2.0]);
    }

    #[test]
    fn test_huge_capacity_clamped() {
        let mut buffer = HistoryBuffer::new(usize::MAX);
        assert_eq!(buffer.capacity(), MAX_HISTORY_CAPACITY);
        for i in 0..MAX_HISTORY_CAPACITY + 5 {
            buffer.append(i);
        }
        assert_eq!(buffer.len(), MAX_HISTORY_CAPACITY);
        assert_eq!(buffer.iter().next(), Some(&5));
    }
}
