//! Insertion-ordered set of dirty page indices.

use std::collections::{HashSet, VecDeque};

/// FIFO of dirty pages with O(1) membership checks.
///
/// A page appears at most once; pushing a page that is already queued keeps
/// its original position.
#[derive(Debug, Default)]
pub struct DirtyQueue {
    order: VecDeque<u64>,
    members: HashSet<u64>,
}

impl DirtyQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `page`. Returns `false` if it was already queued.
    pub fn push(&mut self, page: u64) -> bool {
        if !self.members.insert(page) {
            return false;
        }
        self.order.push_back(page);
        true
    }

    /// Whether `page` is queued.
    pub fn contains(&self, page: u64) -> bool {
        self.members.contains(&page)
    }

    /// Drop `page` from the queue. Returns `false` if it was not queued.
    pub fn remove(&mut self, page: u64) -> bool {
        if !self.members.remove(&page) {
            return false;
        }
        // Flush drains in FIFO order, so the page is almost always first.
        if self.order.front() == Some(&page) {
            self.order.pop_front();
        } else if let Some(pos) = self.order.iter().position(|&p| p == page) {
            self.order.remove(pos);
        }
        true
    }

    /// Queued pages, oldest first.
    pub fn snapshot(&self) -> Vec<u64> {
        self.order.iter().copied().collect()
    }

    /// Number of queued pages.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_without_duplicates() {
        let mut queue = DirtyQueue::new();
        assert!(queue.push(5));
        assert!(queue.push(1));
        assert!(!queue.push(5));
        assert!(queue.push(3));
        assert_eq!(queue.snapshot(), vec![5, 1, 3]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_remove_front_and_middle() {
        let mut queue = DirtyQueue::new();
        for page in [4, 8, 2] {
            queue.push(page);
        }
        assert!(queue.remove(4));
        assert!(queue.remove(2));
        assert!(!queue.remove(2));
        assert_eq!(queue.snapshot(), vec![8]);
        assert!(!queue.contains(4));
    }

    #[test]
    fn test_requeue_after_remove_goes_to_back() {
        let mut queue = DirtyQueue::new();
        queue.push(1);
        queue.push(2);
        queue.remove(1);
        queue.push(1);
        assert_eq!(queue.snapshot(), vec![2, 1]);
        queue.remove(2);
        queue.remove(1);
        assert!(queue.is_empty());
    }
}
