use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use anyhow::Result;

use crate::common::types::{PageId, PagePtr};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::disk::DiskManager;

/// A pool of buffer pool instances sharing one disk file.
///
/// Instance `k` owns the page ids with `id % num_instances == k`, so every
/// request touches exactly one instance and contention is confined to
/// `1/num_instances` of the page-id space.
pub struct ParallelBufferPoolManager {
    instances: Vec<Arc<BufferPoolManager>>,
    next_instance: AtomicUsize,
}

impl ParallelBufferPoolManager {
    /// Create `num_instances` pools of `pool_size` frames each over a
    /// shared database file
    pub fn new(
        num_instances: u32,
        pool_size: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let instances = (0..num_instances)
            .map(|index| {
                Arc::new(BufferPoolManager::with_disk_manager(
                    pool_size,
                    num_instances,
                    index,
                    disk_manager.clone(),
                ))
            })
            .collect();

        Ok(Self {
            instances,
            next_instance: AtomicUsize::new(0),
        })
    }

    /// Total number of frames across all instances
    pub fn pool_size(&self) -> usize {
        self.instances.iter().map(|bpm| bpm.pool_size()).sum()
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Create a new page on some instance, round-robining the starting
    /// instance so allocations spread across shards
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let n = self.instances.len();
        let start = self.next_instance.fetch_add(1, Ordering::SeqCst) % n;

        for offset in 0..n {
            match self.instances[(start + offset) % n].new_page() {
                Ok(result) => return Ok(result),
                Err(BufferPoolError::BufferPoolFull) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(BufferPoolError::BufferPoolFull)
    }

    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).flush_page(page_id)
    }

    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.instance_for(page_id).delete_page(page_id)
    }

    fn instance_for(&self, page_id: PageId) -> &Arc<BufferPoolManager> {
        &self.instances[page_id as usize % self.instances.len()]
    }
}
