use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::ReadLatched;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;

/// Forward iterator over the leaf chain in ascending key order.
///
/// Holds the current leaf pinned and read-latched. Advancing past the end
/// of a leaf latches the next leaf before releasing the current one, so
/// the chain pointer it follows is always observed consistently.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    position: Option<IterPosition<K>>,
}

struct IterPosition<K> {
    page_id: PageId,
    #[allow(dead_code)]
    guard: PageReadGuard,
    node: BTreeNode<K>,
    index: usize,
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + DeserializeOwned,
{
    pub(crate) fn new(buffer_pool: Arc<BufferPoolManager>, latched: ReadLatched<K>, index: usize) -> Self {
        let ReadLatched { page_id, guard, node } = latched;
        Self {
            buffer_pool,
            position: Some(IterPosition {
                page_id,
                guard,
                node,
                index,
            }),
        }
    }

    /// The past-the-end iterator of an empty tree
    pub(crate) fn exhausted(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            position: None,
        }
    }

    fn fetch_leaf(&self, page_id: PageId) -> Result<IterPosition<K>, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let guard = page.read_arc();
        match deserialize_node::<K>(&guard) {
            Ok(node) if node.is_leaf() => Ok(IterPosition {
                page_id,
                guard,
                node,
                index: 0,
            }),
            Ok(_) => {
                drop(guard);
                let _ = self.buffer_pool.unpin_page(page_id, false);
                Err(BTreeError::InvalidPageFormat)
            }
            Err(e) => {
                drop(guard);
                let _ = self.buffer_pool.unpin_page(page_id, false);
                Err(e)
            }
        }
    }

    fn release_current(&mut self) {
        if let Some(position) = self.position.take() {
            let _ = self.buffer_pool.unpin_page(position.page_id, false);
            // Latch drops with `position`.
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + DeserializeOwned,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next_page_id = {
                let position = self.position.as_mut()?;
                if position.index < position.node.keys.len() {
                    let item = (
                        position.node.keys[position.index].clone(),
                        position.node.values[position.index],
                    );
                    position.index += 1;
                    return Some(item);
                }
                position.node.next_page_id
            };

            if next_page_id == INVALID_PAGE_ID {
                self.release_current();
                return None;
            }

            // Latch the successor before letting go of the current leaf.
            match self.fetch_leaf(next_page_id) {
                Ok(next) => {
                    self.release_current();
                    self.position = Some(next);
                }
                Err(e) => {
                    warn!("btree iterator stopped early: {e}");
                    self.release_current();
                    return None;
                }
            }
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(position) = self.position.take() {
            let _ = self.buffer_pool.unpin_page(position.page_id, false);
        }
    }
}
