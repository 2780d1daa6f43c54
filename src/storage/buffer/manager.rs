use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::container::hash::ExtendibleHashTable;
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Directory bucket size for the page table
const PAGE_TABLE_BUCKET_SIZE: usize = 8;

/// Buffer pool manager: a fixed array of frames fronting the disk file.
///
/// The page table maps resident page ids to frames, the free list holds
/// unused frames, and the LRU-K replacer picks victims among unpinned
/// frames. Public operations serialize on `latch`; disk I/O for victim
/// writeback and page loads happens inside it, because a frame cannot be
/// handed out until its previous contents are safely on disk.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_manager: Arc<DiskManager>,
    latch: Mutex<()>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, replacer_k, disk_manager))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            free_list: Mutex::new(free_list),
            disk_manager,
            latch: Mutex::new(()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Allocate a fresh page and pin it into a frame. The contents start
    /// zeroed and the frame starts dirty, since nothing is on disk yet.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let _latch = self.latch.lock();

        let frame_id = self.allocate_frame()?;
        let page_id = self.disk_manager.allocate_page();

        let frame = &self.frames[frame_id as usize];
        {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                *page_guard = Page::new(page_id);
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = true;
        }

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id)?;
        self.replacer.set_evictable(frame_id, false);

        let frame_guard = frame.read();
        Ok((frame_guard.page.clone(), page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }
        let _latch = self.latch.lock();

        // Fast path: already resident.
        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id as usize];
            {
                let mut frame_guard = frame.write();
                frame_guard.pin_count += 1;
            }
            self.replacer.record_access(frame_id)?;
            self.replacer.set_evictable(frame_id, false);

            let frame_guard = frame.read();
            return Ok(frame_guard.page.clone());
        }

        let frame_id = self.allocate_frame()?;

        let mut new_page = Page::new(page_id);
        self.disk_manager.read_page(page_id, &mut new_page)?;

        let frame = &self.frames[frame_id as usize];
        {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                *page_guard = new_page;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
        }

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id)?;
        self.replacer.set_evictable(frame_id, false);

        let frame_guard = frame.read();
        Ok(frame_guard.page.clone())
    }

    /// Return a borrow taken with `fetch_page`/`new_page`. The dirty flag
    /// is sticky: once set it survives until the page is flushed.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let _latch = self.latch.lock();

        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let frame = &self.frames[frame_id as usize];
        let pin_count = {
            let mut frame_guard = frame.write();
            if frame_guard.pin_count > 0 {
                frame_guard.pin_count -= 1;
            }
            if is_dirty {
                frame_guard.is_dirty = true;
            }
            frame_guard.pin_count
        };

        if pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Write a resident page to disk and clear its dirty flag. Flushing a
    /// non-resident page is a no-op.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let _latch = self.latch.lock();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(());
        };
        self.flush_frame(frame_id)
    }

    /// Write every resident page to disk, clearing dirty flags
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let _latch = self.latch.lock();
        for frame_id in 0..self.pool_size as FrameId {
            let resident = {
                let frame_guard = self.frames[frame_id as usize].read();
                let page_guard = frame_guard.page.read();
                page_guard.page_id != INVALID_PAGE_ID
            };
            if resident {
                self.flush_frame(frame_id)?;
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and retire its id. Fails when pinned;
    /// succeeds trivially when not resident. The frame is not flushed.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let _latch = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(());
        };

        let frame = &self.frames[frame_id as usize];
        {
            let mut frame_guard = frame.write();
            if frame_guard.pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }
            {
                let mut page_guard = frame_guard.page.write();
                *page_guard = Page::new(INVALID_PAGE_ID);
            }
            frame_guard.is_dirty = false;
        }

        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        self.free_list.lock().push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Obtain a frame from the free list, or evict a victim. The victim's
    /// dirty contents are written back before the frame is reused.
    fn allocate_frame(&self) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let Some(victim_id) = self.replacer.evict() else {
            return Err(BufferPoolError::BufferPoolFull);
        };

        let frame = &self.frames[victim_id as usize];
        let mut frame_guard = frame.write();

        let old_page_id = {
            let page_guard = frame_guard.page.read();
            page_guard.page_id
        };
        if frame_guard.is_dirty {
            debug!("evicting dirty page {old_page_id} from frame {victim_id}");
            let snapshot = frame_guard.page.read().clone();
            self.disk_manager.write_page(&snapshot)?;
            frame_guard.is_dirty = false;
        }
        if old_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&old_page_id);
        }

        Ok(victim_id)
    }

    fn flush_frame(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        let snapshot = frame_guard.page.read().clone();
        self.disk_manager.write_page(&snapshot)?;
        frame_guard.is_dirty = false;
        Ok(())
    }
}
