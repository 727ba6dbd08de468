use std::collections::VecDeque;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU (Least Recently Used) page replacement policy.
///
/// Tracks the set of evictable frames in least-recently-unpinned order.
/// The buffer pool removes a frame from the replacer while the frame is
/// pinned and re-inserts it once its pin count drops back to zero.
pub struct LRUReplacer {
    lru_list: Mutex<VecDeque<FrameId>>,
}

impl LRUReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            lru_list: Mutex::new(VecDeque::with_capacity(pool_size)),
        }
    }

    /// Mark a frame evictable, appending it at the most-recently-used end.
    ///
    /// A frame that is already evictable keeps its current position.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut lru_list = self.lru_list.lock();
        if !lru_list.contains(&frame_id) {
            lru_list.push_back(frame_id);
        }
    }

    /// Remove a frame from the evictable set. No-op if it is not present.
    pub fn pin(&self, frame_id: FrameId) {
        let mut lru_list = self.lru_list.lock();
        if let Some(pos) = lru_list.iter().position(|&id| id == frame_id) {
            lru_list.remove(pos);
        }
    }

    /// Victim selection: remove and return the least recently used frame
    pub fn victim(&self) -> Option<FrameId> {
        self.lru_list.lock().pop_front()
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.lru_list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order_is_fifo() {
        let replacer = LRUReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_unpin_is_idempotent() {
        let replacer = LRUReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_removes_from_evictable_set() {
        let replacer = LRUReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        // Pinning a frame that is not present is a no-op
        replacer.pin(7);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(2));
    }

    #[test]
    fn test_reunpinned_frame_moves_to_tail() {
        let replacer = LRUReplacer::new(4);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        replacer.unpin(1);

        // Frame 1 was re-unpinned after 2, so 2 is now the oldest
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(1));
    }
}
