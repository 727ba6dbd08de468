use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::{Mutex, RwLock};
use anyhow::Result;

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LRUReplacer;
use crate::storage::disk::DiskManager;

/// Forward and inverse residency maps, guarded by a single latch.
///
/// Invariant: `page_to_frame[p] == f` iff `frame_to_page[f] == p`.
#[derive(Default)]
struct FrameMaps {
    page_to_frame: HashMap<PageId, FrameId>,
    frame_to_page: HashMap<FrameId, PageId>,
}

/// Buffer pool manager: maps pages to in-memory frames, pinning and
/// evicting through the LRU replacer.
///
/// An instance may be one of `num_instances` shards of a parallel pool;
/// instance `k` owns exactly the page ids with `id % num_instances == k`.
pub struct BufferPoolManager {
    pool_size: usize,
    num_instances: u32,
    instance_index: u32,
    frames: Vec<FramePtr>,
    maps: RwLock<FrameMaps>,
    free_list: Mutex<VecDeque<FrameId>>,
    replacer: LRUReplacer,
    disk_manager: Arc<DiskManager>,
    next_page_id: AtomicU32,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, 1, 0, disk_manager))
    }

    /// Create one shard of a parallel pool over a shared disk manager
    pub fn with_disk_manager(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0, "pool must have at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index out of range"
        );

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for frame_id in 0..pool_size {
            let page = Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            num_instances,
            instance_index,
            frames,
            maps: RwLock::new(FrameMaps::default()),
            free_list: Mutex::new(free_list),
            replacer: LRUReplacer::new(pool_size),
            disk_manager,
            next_page_id: AtomicU32::new(instance_index),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Create a new page, pinned and marked dirty
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut maps = self.maps.write();
        let frame_id = self.acquire_frame(&mut maps)?;
        let page_id = self.allocate_page();

        let frame = &self.frames[frame_id];
        {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                page_guard.reset_memory();
                page_guard.page_id = page_id;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = true;
        }

        maps.page_to_frame.insert(page_id, frame_id);
        maps.frame_to_page.insert(frame_id, page_id);

        let page = frame.read().page.clone();
        Ok((page, page_id))
    }

    /// Fetch a page from the buffer pool or disk, pinning it
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot fetch invalid page ID".to_string(),
            ));
        }

        // Fast path: already resident
        {
            let maps = self.maps.read();
            if let Some(&frame_id) = maps.page_to_frame.get(&page_id) {
                return Ok(self.pin_resident(frame_id));
            }
        }

        let mut maps = self.maps.write();
        // Re-check: another thread may have brought the page in while we
        // were waiting for the exclusive latch
        if let Some(&frame_id) = maps.page_to_frame.get(&page_id) {
            return Ok(self.pin_resident(frame_id));
        }

        let frame_id = self.acquire_frame(&mut maps)?;
        let frame = &self.frames[frame_id];
        {
            let mut frame_guard = frame.write();
            let read_result = {
                let mut page_guard = frame_guard.page.write();
                self.disk_manager.read_page(page_id, &mut page_guard)
            };
            if let Err(e) = read_result {
                // The frame holds no page now; hand it back to the free list
                drop(frame_guard);
                self.free_list.lock().push_back(frame_id);
                return Err(e.into());
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
        }

        maps.page_to_frame.insert(page_id, frame_id);
        maps.frame_to_page.insert(frame_id, page_id);
        self.replacer.pin(frame_id);

        Ok(frame.read().page.clone())
    }

    /// Unpin a page, potentially marking it as dirty
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let maps = self.maps.read();
        let frame_id = match maps.page_to_frame.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let frame = &self.frames[frame_id];
        let now_unpinned = {
            let mut frame_guard = frame.write();
            if frame_guard.pin_count == 0 {
                return Err(BufferPoolError::PageNotPinned(page_id));
            }
            frame_guard.pin_count -= 1;
            if is_dirty {
                frame_guard.is_dirty = true;
            }
            frame_guard.pin_count == 0
        };

        if now_unpinned {
            self.replacer.unpin(frame_id);
        }

        Ok(())
    }

    /// Write a resident page to disk and clear its dirty flag
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let maps = self.maps.read();
        let frame_id = match maps.page_to_frame.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        self.flush_frame(frame_id)
    }

    /// Flush every resident page to disk
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let maps = self.maps.read();
        for &frame_id in maps.page_to_frame.values() {
            self.flush_frame(frame_id)?;
        }
        Ok(())
    }

    /// Delete a page from the buffer pool, returning its frame to the
    /// free list. Deleting a non-resident page succeeds trivially.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut maps = self.maps.write();
        let frame_id = match maps.page_to_frame.get(&page_id) {
            Some(&id) => id,
            None => return Ok(()),
        };

        let frame = &self.frames[frame_id];
        {
            let mut frame_guard = frame.write();
            if frame_guard.pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }

            if frame_guard.is_dirty {
                let page_guard = frame_guard.page.read();
                self.disk_manager.write_page(&page_guard)?;
            }

            {
                let mut page_guard = frame_guard.page.write();
                page_guard.reset_memory();
                page_guard.page_id = INVALID_PAGE_ID;
            }
            frame_guard.is_dirty = false;
        }

        maps.page_to_frame.remove(&page_id);
        maps.frame_to_page.remove(&frame_id);
        self.replacer.pin(frame_id);
        self.free_list.lock().push_back(frame_id);

        // Note: in a real system we would also update disk metadata to mark
        // this page id as free for future allocation

        Ok(())
    }

    /// Allocate the next page id owned by this instance
    fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(self.num_instances, Ordering::SeqCst)
    }

    /// Increment the pin count of a resident frame and shield it from
    /// eviction. Caller has verified residency under the map latch.
    fn pin_resident(&self, frame_id: FrameId) -> PagePtr {
        let frame = &self.frames[frame_id];
        {
            let mut frame_guard = frame.write();
            frame_guard.pin_count += 1;
        }
        self.replacer.pin(frame_id);
        frame.read().page.clone()
    }

    /// Acquire a frame for a new occupant, free list first, then by
    /// evicting the LRU victim (writing it back if dirty). The old
    /// occupant's mappings are removed. Caller holds the map latch
    /// exclusively.
    fn acquire_frame(&self, maps: &mut FrameMaps) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let victim_id = self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;

        let frame = &self.frames[victim_id];
        {
            let mut frame_guard = frame.write();
            debug_assert_eq!(frame_guard.pin_count, 0, "victim frame must be unpinned");

            if frame_guard.is_dirty {
                let write_result = {
                    let page_guard = frame_guard.page.read();
                    self.disk_manager.write_page(&page_guard)
                };
                if let Err(e) = write_result {
                    // Keep the frame evictable so a later call can retry
                    drop(frame_guard);
                    self.replacer.unpin(victim_id);
                    return Err(e.into());
                }
                frame_guard.is_dirty = false;
            }
        }

        if let Some(old_page_id) = maps.frame_to_page.remove(&victim_id) {
            maps.page_to_frame.remove(&old_page_id);
        }

        Ok(victim_id)
    }

    fn flush_frame(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let frame = &self.frames[frame_id];
        let mut frame_guard = frame.write();
        {
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
        }
        frame_guard.is_dirty = false;
        Ok(())
    }
}
