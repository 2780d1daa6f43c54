use std::collections::{HashMap, VecDeque};

use log::trace;
use parking_lot::Mutex;

use crate::common::types::FrameId;
use crate::storage::buffer::error::BufferPoolError;

/// LRU-K page replacement policy.
///
/// Every tracked frame keeps its last k access timestamps. Frames with
/// fewer than k recorded accesses form the *history* set and are evicted
/// first, oldest first access wins; frames with k or more form the *cache*
/// set and compete on their k-th most recent access timestamp. Only frames
/// flagged evictable are candidates.
pub struct LruKReplacer {
    inner: Mutex<LruKInner>,
}

struct LruKInner {
    node_store: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
    curr_size: usize,
    replacer_size: usize,
    k: usize,
}

struct LruKNode {
    /// Most recent k access timestamps, oldest at the front
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k > 0");
        Self {
            inner: Mutex::new(LruKInner {
                node_store: HashMap::with_capacity(num_frames),
                current_timestamp: 0,
                curr_size: 0,
                replacer_size: num_frames,
                k,
            }),
        }
    }

    /// Record an access to the frame at the current logical timestamp
    pub fn record_access(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        if frame_id as usize >= inner.replacer_size {
            return Err(BufferPoolError::FrameOutOfRange(frame_id));
        }

        let ts = inner.current_timestamp;
        inner.current_timestamp += 1;

        let k = inner.k;
        let node = inner.node_store.entry(frame_id).or_insert_with(|| LruKNode {
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        });
        node.history.push_back(ts);
        if node.history.len() > k {
            node.history.pop_front();
        }
        Ok(())
    }

    /// Flip the evictable flag, maintaining the evictable count
    pub fn set_evictable(&self, frame_id: FrameId, set_evictable: bool) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.node_store.get_mut(&frame_id) else {
            return;
        };
        if node.is_evictable != set_evictable {
            node.is_evictable = set_evictable;
            if set_evictable {
                inner.curr_size += 1;
            } else {
                inner.curr_size -= 1;
            }
        }
    }

    /// Pick and forget a victim frame, or None when nothing is evictable
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let k = inner.k;

        // History frames first: classic LRU on the first recorded access.
        let mut victim: Option<(FrameId, u64)> = None;
        for (&frame_id, node) in inner.node_store.iter() {
            if !node.is_evictable || node.history.len() >= k {
                continue;
            }
            let Some(&oldest) = node.history.front() else {
                continue;
            };
            if victim.map_or(true, |(_, best)| oldest < best) {
                victim = Some((frame_id, oldest));
            }
        }

        // Otherwise the cache set: smallest k-th most recent timestamp,
        // i.e. the largest backward k-distance.
        if victim.is_none() {
            for (&frame_id, node) in inner.node_store.iter() {
                if !node.is_evictable || node.history.len() < k {
                    continue;
                }
                let Some(&kth_recent) = node.history.front() else {
                    continue;
                };
                if victim.map_or(true, |(_, best)| kth_recent < best) {
                    victim = Some((frame_id, kth_recent));
                }
            }
        }

        let (frame_id, _) = victim?;
        inner.node_store.remove(&frame_id);
        inner.curr_size -= 1;
        trace!("lru-k evicting frame {frame_id}");
        Some(frame_id)
    }

    /// Forget a frame entirely. The caller asserts the frame is evictable;
    /// removing a pinned frame is a caller bug.
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.node_store.get(&frame_id) else {
            return;
        };
        assert!(
            node.is_evictable,
            "remove() called on non-evictable frame {frame_id}"
        );
        inner.node_store.remove(&frame_id);
        inner.curr_size -= 1;
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.inner.lock().curr_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_before_cache_victims() {
        // num_frames=7, k=2; access 1,2,3,4,1,2,3,4,5,6 then everything is
        // evictable. 5 and 6 have a single access each, so they go first in
        // first-access order; then frame 1 has the smallest 2nd-most-recent
        // timestamp among the cache set.
        let replacer = LruKReplacer::new(7, 2);
        for frame_id in [1, 2, 3, 4, 1, 2, 3, 4, 5, 6] {
            replacer.record_access(frame_id).unwrap();
        }
        for frame_id in 1..=6 {
            replacer.set_evictable(frame_id, true);
        }
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.evict(), Some(5));
        assert_eq!(replacer.evict(), Some(6));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 3);
    }

    #[test]
    fn test_non_evictable_frames_are_skipped() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0).unwrap();
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true);

        // Frame 0 is older but pinned.
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_access_promotes_within_cache_set() {
        let replacer = LruKReplacer::new(3, 2);
        for frame_id in [0, 1, 0, 1] {
            replacer.record_access(frame_id).unwrap();
        }
        // Touch frame 0 again: its 2nd-most-recent access is now newer
        // than frame 1's.
        replacer.record_access(0).unwrap();
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_size_tracks_evictable_toggles() {
        let replacer = LruKReplacer::new(4, 2);
        for frame_id in 0..4 {
            replacer.record_access(frame_id).unwrap();
        }
        assert_eq!(replacer.size(), 0);
        for frame_id in 0..4 {
            replacer.set_evictable(frame_id, true);
        }
        assert_eq!(replacer.size(), 4);
        replacer.set_evictable(2, false);
        replacer.set_evictable(2, false);
        assert_eq!(replacer.size(), 3);
    }

    #[test]
    fn test_record_access_out_of_range() {
        let replacer = LruKReplacer::new(4, 2);
        assert!(matches!(
            replacer.record_access(4),
            Err(BufferPoolError::FrameOutOfRange(4))
        ));
        assert!(replacer.record_access(3).is_ok());
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn test_remove_non_evictable_panics() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0).unwrap();
        replacer.remove(0);
    }

    #[test]
    fn test_remove_untracked_is_noop() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.remove(2);
        assert_eq!(replacer.size(), 0);
    }
}
