use std::collections::VecDeque;

/// Fixed-capacity FIFO store. Pushing into a full ring evicts the oldest
/// element. Order is arrival order; elements are never re-sorted.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty ring. The backing storage is allocated up front so
    /// steady-state pushes never allocate.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `item`, returning the evicted element when the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently inserted element.
    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Newest to oldest, the order every windowed scan walks.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &T> {
        self.items.iter().rev()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_below_capacity() {
        let mut ring = RingBuffer::with_capacity(3);
        assert!(ring.is_empty());
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.newest(), Some(&2));
    }

    #[test]
    fn test_overflow_keeps_last_capacity_in_order() {
        let mut ring = RingBuffer::with_capacity(300);
        for i in 0..1000u32 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 300);
        let kept: Vec<u32> = ring.iter().copied().collect();
        let expected: Vec<u32> = (700..1000).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_push_returns_evicted_oldest() {
        let mut ring = RingBuffer::with_capacity(2);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.push("c"), Some("a"));
        assert_eq!(ring.push("d"), Some("b"));
    }

    #[test]
    fn test_arrival_order_not_sorted() {
        let mut ring = RingBuffer::with_capacity(4);
        ring.push(30);
        ring.push(10);
        ring.push(20);
        let newest_first: Vec<i32> = ring.iter_newest_first().copied().collect();
        assert_eq!(newest_first, vec![20, 10, 30]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut ring = RingBuffer::with_capacity(0);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_clear() {
        let mut ring = RingBuffer::with_capacity(2);
        ring.push(1);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.newest(), None);
    }
}
