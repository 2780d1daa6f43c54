use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{
    PageId, PageReadGuard, PageWriteGuard, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::BTreeIterator;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node, write_parent_pointer};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

/// A page fetched, read-latched, and decoded for a traversal
pub(crate) struct ReadLatched<K> {
    pub(crate) page_id: PageId,
    pub(crate) guard: PageReadGuard,
    pub(crate) node: BTreeNode<K>,
}

/// A page fetched, write-latched, and decoded. The node image is mutated
/// in memory and serialized back into the page on release.
struct WriteLatched<K> {
    page_id: PageId,
    guard: PageWriteGuard,
    node: BTreeNode<K>,
}

/// On-disk, concurrent B+Tree index.
///
/// All page access goes through the buffer pool. Traversals latch-crab:
/// read paths release the parent as soon as the child is latched, write
/// paths keep the chain of unsafe ancestors latched (and pinned) in a
/// stack until the structural change resolves. A latched page is always
/// pinned, and modified pages are unpinned dirty before their latch drops.
pub struct BTreeIndex<K> {
    name: String,
    buffer_pool: Arc<BufferPoolManager>,
    /// Also serves as the tree-level mutex for first-root creation
    root_page_id: RwLock<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _key: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open or create the named index. The root page id is persisted in
    /// the header page directory under `name`.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(
            leaf_max_size >= 3 && internal_max_size >= 3,
            "node capacity must leave room for a sentinel slot and a split"
        );
        let name = name.into();

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let mut registered = false;
        let root_page_id = {
            let mut guard = header.write();
            match HeaderPage::get_record(&guard, &name) {
                Some(root) => root,
                None => {
                    HeaderPage::insert_record(&mut guard, &name, INVALID_PAGE_ID)?;
                    registered = true;
                    INVALID_PAGE_ID
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, registered)?;

        Ok(Self {
            name,
            buffer_pool,
            root_page_id: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let Some(mut current) = self.latch_root_read()? else {
            return Ok(None);
        };
        while !current.node.is_leaf() {
            let child_id = current.node.child_for(key);
            let child = match self.latch_read(child_id) {
                Ok(child) => child,
                Err(e) => {
                    self.release_read(current);
                    return Err(e);
                }
            };
            self.release_read(current);
            current = child;
        }
        let result = current.node.leaf_lookup(key);
        self.release_read(current);
        Ok(result)
    }

    /// Insert a unique key. Returns false when the key already exists.
    pub fn insert(&self, key: K, value: Rid) -> Result<bool, BTreeError> {
        let mut stack: Vec<WriteLatched<K>> = Vec::new();
        // A concurrent remove can empty the tree between the check and the
        // descent, so creation retries.
        let root = loop {
            if self.is_empty() {
                self.start_new_tree()?;
            }
            if let Some(root) = self.latch_root_write()? {
                break root;
            }
        };
        stack.push(root);

        loop {
            let (at_leaf, child_id) = {
                let last = stack
                    .last()
                    .ok_or_else(|| BTreeError::Corrupted("empty latch stack".to_string()))?;
                if last.node.is_leaf() {
                    (true, INVALID_PAGE_ID)
                } else {
                    (false, last.node.child_for(&key))
                }
            };
            if at_leaf {
                break;
            }
            let child = match self.latch_write(child_id) {
                Ok(child) => child,
                Err(e) => {
                    self.release_stack_clean(&mut stack);
                    return Err(e);
                }
            };
            // Crab: ancestors can be let go once the child cannot split.
            if child.node.is_insert_safe() {
                self.release_stack_clean(&mut stack);
            }
            stack.push(child);
        }

        let mut leaf = stack
            .pop()
            .ok_or_else(|| BTreeError::Corrupted("descend ended with no leaf".to_string()))?;

        if !leaf.node.leaf_insert(key, value) {
            self.release_write(leaf, false)?;
            self.release_stack_clean(&mut stack);
            return Ok(false);
        }

        if !leaf.node.needs_split() {
            self.release_write(leaf, true)?;
            self.release_stack_clean(&mut stack);
            return Ok(true);
        }

        // The leaf hit its sentinel slot: carve off a right sibling and
        // push the separator into the latched parent chain.
        let split = self.split_leaf(&mut leaf);
        let (separator, sibling_id) = match split {
            Ok(parts) => parts,
            Err(e) => {
                self.release_stack_clean(&mut stack);
                let _ = self.release_write(leaf, true);
                return Err(e);
            }
        };
        let result = self.insert_into_parent(&mut stack, leaf, separator, sibling_id);
        self.release_stack_clean(&mut stack);
        result?;
        Ok(true)
    }

    /// Remove a key. Returns false when the key is absent.
    pub fn remove(&self, key: &K) -> Result<bool, BTreeError> {
        if self.is_empty() {
            return Ok(false);
        }
        let mut stack: Vec<WriteLatched<K>> = Vec::new();
        let Some(root) = self.latch_root_write()? else {
            return Ok(false);
        };
        stack.push(root);

        loop {
            let (at_leaf, child_id) = {
                let last = stack
                    .last()
                    .ok_or_else(|| BTreeError::Corrupted("empty latch stack".to_string()))?;
                if last.node.is_leaf() {
                    (true, INVALID_PAGE_ID)
                } else {
                    (false, last.node.child_for(key))
                }
            };
            if at_leaf {
                break;
            }
            let child = match self.latch_write(child_id) {
                Ok(child) => child,
                Err(e) => {
                    self.release_stack_clean(&mut stack);
                    return Err(e);
                }
            };
            // Children on the path are never the root: safe means no merge.
            if child.node.size() > child.node.min_size() {
                self.release_stack_clean(&mut stack);
            }
            stack.push(child);
        }

        let mut leaf = stack
            .pop()
            .ok_or_else(|| BTreeError::Corrupted("descend ended with no leaf".to_string()))?;

        if !leaf.node.leaf_remove(key) {
            self.release_write(leaf, false)?;
            self.release_stack_clean(&mut stack);
            return Ok(false);
        }

        let result = self.resolve_underflow(&mut stack, leaf);
        self.release_stack_clean(&mut stack);
        result?;
        Ok(true)
    }

    /// Iterate the whole tree in key order
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let Some(mut current) = self.latch_root_read()? else {
            return Ok(BTreeIterator::exhausted(self.buffer_pool.clone()));
        };
        while !current.node.is_leaf() {
            let child_id = match current.node.children.first().copied() {
                Some(id) => id,
                None => {
                    self.release_read(current);
                    return Err(BTreeError::Corrupted("internal node with no children".to_string()));
                }
            };
            let child = match self.latch_read(child_id) {
                Ok(child) => child,
                Err(e) => {
                    self.release_read(current);
                    return Err(e);
                }
            };
            self.release_read(current);
            current = child;
        }
        Ok(BTreeIterator::new(self.buffer_pool.clone(), current, 0))
    }

    /// Iterate starting from the first key >= `key`
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let Some(mut current) = self.latch_root_read()? else {
            return Ok(BTreeIterator::exhausted(self.buffer_pool.clone()));
        };
        while !current.node.is_leaf() {
            let child_id = current.node.child_for(key);
            let child = match self.latch_read(child_id) {
                Ok(child) => child,
                Err(e) => {
                    self.release_read(current);
                    return Err(e);
                }
            };
            self.release_read(current);
            current = child;
        }
        let index = current.node.key_index(key);
        Ok(BTreeIterator::new(self.buffer_pool.clone(), current, index))
    }

    /// All record ids with keys in `[start_key, end_key]`
    pub fn range_scan(&self, start_key: &K, end_key: &K) -> Result<Vec<Rid>, BTreeError> {
        if start_key > end_key {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (key, rid) in self.iter_from(start_key)? {
            if &key > end_key {
                break;
            }
            out.push(rid);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Latching helpers
    // ------------------------------------------------------------------

    fn latch_read(&self, page_id: PageId) -> Result<ReadLatched<K>, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let guard = page.read_arc();
        match deserialize_node(&guard) {
            Ok(node) => Ok(ReadLatched { page_id, guard, node }),
            Err(e) => {
                drop(guard);
                let _ = self.buffer_pool.unpin_page(page_id, false);
                Err(e)
            }
        }
    }

    fn latch_write(&self, page_id: PageId) -> Result<WriteLatched<K>, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let guard = page.write_arc();
        match deserialize_node(&guard) {
            Ok(node) => Ok(WriteLatched { page_id, guard, node }),
            Err(e) => {
                drop(guard);
                let _ = self.buffer_pool.unpin_page(page_id, false);
                Err(e)
            }
        }
    }

    /// Latch the root, re-validating against concurrent root switches.
    /// None when the tree is empty.
    fn latch_root_read(&self) -> Result<Option<ReadLatched<K>>, BTreeError> {
        loop {
            let root_id = *self.root_page_id.read();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let latched = self.latch_read(root_id)?;
            if *self.root_page_id.read() == root_id {
                return Ok(Some(latched));
            }
            self.release_read(latched);
        }
    }

    fn latch_root_write(&self) -> Result<Option<WriteLatched<K>>, BTreeError> {
        loop {
            let root_id = *self.root_page_id.read();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let latched = self.latch_write(root_id)?;
            if *self.root_page_id.read() == root_id {
                return Ok(Some(latched));
            }
            self.release_write(latched, false)?;
        }
    }

    fn release_read(&self, latched: ReadLatched<K>) {
        let ReadLatched { page_id, guard, .. } = latched;
        let _ = self.buffer_pool.unpin_page(page_id, false);
        drop(guard);
    }

    /// Serialize (when dirty) and unpin before the latch drops
    fn release_write(&self, mut latched: WriteLatched<K>, dirty: bool) -> Result<(), BTreeError> {
        if dirty {
            serialize_node(&latched.node, &mut latched.guard)?;
        }
        self.buffer_pool.unpin_page(latched.page_id, dirty)?;
        drop(latched.guard);
        Ok(())
    }

    /// Release every retained ancestor, oldest first, unmodified
    fn release_stack_clean(&self, stack: &mut Vec<WriteLatched<K>>) {
        for latched in stack.drain(..) {
            let _ = self.buffer_pool.unpin_page(latched.page_id, false);
            drop(latched.guard);
        }
    }

    // ------------------------------------------------------------------
    // Structural changes
    // ------------------------------------------------------------------

    /// Race-free creation of the first root; the root id write lock is the
    /// tree-level mutex.
    fn start_new_tree(&self) -> Result<(), BTreeError> {
        let mut root = self.root_page_id.write();
        if *root != INVALID_PAGE_ID {
            // Another writer beat us to it.
            return Ok(());
        }
        let (page, page_id) = self.buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            let node: BTreeNode<K> = BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            serialize_node(&node, &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        *root = page_id;
        self.update_root_record(page_id)?;
        debug!("btree {}: created root leaf in page {}", self.name, page_id);
        Ok(())
    }

    /// Allocate a right sibling for an overflowing leaf and move its upper
    /// half there. Returns the separator key and the sibling's page id.
    fn split_leaf(&self, leaf: &mut WriteLatched<K>) -> Result<(K, PageId), BTreeError> {
        let (sibling_page, sibling_id) = self.buffer_pool.new_page()?;
        let right = leaf.node.split_leaf(sibling_id);
        let separator = right
            .keys
            .first()
            .cloned()
            .ok_or_else(|| BTreeError::Corrupted("split produced an empty sibling".to_string()))?;
        {
            let mut guard = sibling_page.write();
            serialize_node(&right, &mut guard)?;
        }
        self.buffer_pool.unpin_page(sibling_id, true)?;
        Ok((separator, sibling_id))
    }

    /// Thread a freshly split-off sibling into the tree. `left` is still
    /// latched; its parent, when one exists, sits on top of the stack by
    /// the crab invariant (a node that split was not insert-safe).
    fn insert_into_parent(
        &self,
        stack: &mut Vec<WriteLatched<K>>,
        mut left: WriteLatched<K>,
        separator: K,
        right_page_id: PageId,
    ) -> Result<(), BTreeError> {
        if stack.is_empty() {
            // The old root split: grow the tree by one level.
            debug_assert!(left.node.is_root());
            let (root_page, root_id) = self.buffer_pool.new_page()?;
            let mut new_root: BTreeNode<K> =
                BTreeNode::new_internal(root_id, INVALID_PAGE_ID, self.internal_max_size);
            new_root.keys.push(separator);
            new_root.children.push(left.page_id);
            new_root.children.push(right_page_id);
            {
                let mut guard = root_page.write();
                serialize_node(&new_root, &mut guard)?;
            }
            self.buffer_pool.unpin_page(root_id, true)?;

            // Publish the new root while the old one is still latched, so
            // readers entering through either id serialize correctly.
            {
                let mut root = self.root_page_id.write();
                *root = root_id;
                self.update_root_record(root_id)?;
            }
            left.node.parent_page_id = root_id;
            self.release_write(left, true)?;
            self.set_parent(right_page_id, root_id)?;
            debug!("btree {}: root split, new root page {}", self.name, root_id);
            return Ok(());
        }

        let mut parent = match stack.pop() {
            Some(parent) => parent,
            None => return Err(BTreeError::Corrupted("split with no latched parent".to_string())),
        };
        self.release_write(left, true)?;

        parent.node.internal_insert(separator, right_page_id);
        self.set_parent(right_page_id, parent.page_id)?;

        if !parent.node.needs_split() {
            return self.release_write(parent, true);
        }

        // The parent overflows in turn.
        let (sibling_page, sibling_id) = self.buffer_pool.new_page()?;
        let (right, lifted) = parent.node.split_internal(sibling_id);
        {
            let mut guard = sibling_page.write();
            serialize_node(&right, &mut guard)?;
        }
        self.buffer_pool.unpin_page(sibling_id, true)?;
        for &child in &right.children {
            self.set_parent(child, sibling_id)?;
        }
        self.insert_into_parent(stack, parent, lifted, sibling_id)
    }

    /// Restore the minimum-occupancy invariant after a delete, borrowing
    /// from or merging with a sibling under the latched parent, recursing
    /// upward as merges shrink the parent.
    fn resolve_underflow(
        &self,
        stack: &mut Vec<WriteLatched<K>>,
        mut current: WriteLatched<K>,
    ) -> Result<(), BTreeError> {
        if stack.is_empty() {
            // `current` is the root.
            if current.node.is_leaf() && current.node.size() == 0 {
                {
                    let mut root = self.root_page_id.write();
                    *root = INVALID_PAGE_ID;
                    self.update_root_record(INVALID_PAGE_ID)?;
                }
                let page_id = current.page_id;
                self.release_write(current, true)?;
                self.buffer_pool.delete_page(page_id)?;
                debug!("btree {}: tree emptied", self.name);
                return Ok(());
            }
            if !current.node.is_leaf() && current.node.size() == 1 {
                // An internal root with a single child hands the root over.
                let new_root = match current.node.children.first().copied() {
                    Some(id) => id,
                    None => {
                        return Err(BTreeError::Corrupted(
                            "internal root with no children".to_string(),
                        ))
                    }
                };
                {
                    let mut root = self.root_page_id.write();
                    *root = new_root;
                    self.update_root_record(new_root)?;
                }
                self.set_parent(new_root, INVALID_PAGE_ID)?;
                let page_id = current.page_id;
                self.release_write(current, true)?;
                self.buffer_pool.delete_page(page_id)?;
                debug!("btree {}: root collapsed into page {}", self.name, new_root);
                return Ok(());
            }
            return self.release_write(current, true);
        }

        if current.node.size() >= current.node.min_size() {
            return self.release_write(current, true);
        }

        let mut parent = match stack.pop() {
            Some(parent) => parent,
            None => return Err(BTreeError::Corrupted("underflow with no latched parent".to_string())),
        };
        let child_pos = match parent.node.children.iter().position(|&c| c == current.page_id) {
            Some(pos) => pos,
            None => {
                let _ = self.release_write(current, true);
                let _ = self.release_write(parent, false);
                return Err(BTreeError::Corrupted(
                    "child missing from latched parent".to_string(),
                ));
            }
        };
        // Prefer the left sibling; either way it is reached through the
        // latched parent, which orders sibling latch acquisition.
        let (sibling_pos, separator_idx, sibling_is_left) = if child_pos > 0 {
            (child_pos - 1, child_pos - 1, true)
        } else {
            (child_pos + 1, child_pos, false)
        };
        let sibling_id = parent.node.children[sibling_pos];
        let mut sibling = match self.latch_write(sibling_id) {
            Ok(sibling) => sibling,
            Err(e) => {
                let _ = self.release_write(current, true);
                let _ = self.release_write(parent, false);
                return Err(e);
            }
        };
        let separator = match parent.node.keys.get(separator_idx).cloned() {
            Some(key) => key,
            None => {
                let _ = self.release_write(current, true);
                let _ = self.release_write(sibling, false);
                let _ = self.release_write(parent, false);
                return Err(BTreeError::Corrupted("separator index out of range".to_string()));
            }
        };

        let effective_max = current.node.max_size - 1;
        if sibling.node.size() + current.node.size() <= effective_max {
            // Merge the right node into the left-positioned one.
            let (mut left, right) = if sibling_is_left {
                (sibling, current)
            } else {
                (current, sibling)
            };
            let WriteLatched {
                page_id: right_id,
                guard: right_guard,
                node: right_node,
            } = right;
            let moved_children = right_node.children.clone();
            if left.node.is_leaf() {
                left.node.merge_leaf(right_node);
            } else {
                left.node.merge_internal(separator, right_node);
                for &child in &moved_children {
                    self.set_parent(child, left.page_id)?;
                }
            }
            self.buffer_pool.unpin_page(right_id, true)?;
            drop(right_guard);

            self.release_write(left, true)?;
            self.buffer_pool.delete_page(right_id)?;

            parent.node.internal_remove_at(separator_idx);
            return self.resolve_underflow(stack, parent);
        }

        // Redistribute a single entry through the parent separator.
        if sibling_is_left {
            if current.node.is_leaf() {
                let (stolen_key, stolen_value) = sibling.node.leaf_pop_back();
                parent.node.keys[separator_idx] = stolen_key.clone();
                current.node.leaf_push_front(stolen_key, stolen_value);
            } else {
                let (last_key, last_child) = sibling.node.internal_pop_back();
                current.node.internal_push_front(separator, last_child);
                parent.node.keys[separator_idx] = last_key;
                self.set_parent(last_child, current.page_id)?;
            }
        } else if current.node.is_leaf() {
            let (stolen_key, stolen_value) = sibling.node.leaf_pop_front();
            current.node.leaf_push_back(stolen_key, stolen_value);
            parent.node.keys[separator_idx] = match sibling.node.keys.first().cloned() {
                Some(key) => key,
                None => {
                    return Err(BTreeError::Corrupted(
                        "redistribution emptied the right sibling".to_string(),
                    ))
                }
            };
        } else {
            let (first_key, first_child) = sibling.node.internal_pop_front();
            current.node.internal_push_back(separator, first_child);
            parent.node.keys[separator_idx] = first_key;
            self.set_parent(first_child, current.page_id)?;
        }

        self.release_write(sibling, true)?;
        self.release_write(current, true)?;
        self.release_write(parent, true)
    }

    /// Patch a child's parent pointer in place
    fn set_parent(&self, page_id: PageId, parent_page_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        {
            let mut guard = page.write();
            write_parent_pointer(&mut guard, parent_page_id);
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    /// Rewrite this index's record in the header page
    fn update_root_record(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            HeaderPage::update_record(&mut guard, &self.name, root_page_id)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }
}
