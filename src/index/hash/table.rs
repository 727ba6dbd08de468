use std::marker::PhantomData;
use std::sync::Arc;
use anyhow::Result;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::common::types::{PageId, PagePtr};
use crate::index::hash::bucket::BucketPage;
use crate::index::hash::directory::DirectoryPage;
use crate::index::hash::error::HashIndexError;
use crate::index::hash::key::{IndexKey, IndexValue, KeyComparator, KeyHasher};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};

/// Disk-backed extendible hash table.
///
/// A single directory page maps the low `global_depth` bits of a key's
/// hash to a bucket page. Buckets split (growing the directory when
/// needed) as they fill and merge with their split image when they drain.
///
/// The directory structure is guarded by `table_latch`; individual
/// buckets are guarded by their page latches. Readers and plain
/// inserts/removes take the table latch shared; split and merge take it
/// exclusive.
pub struct ExtendibleHashTable<K, V, C, H> {
    buffer_pool: Arc<BufferPoolManager>,
    directory_page_id: PageId,
    table_latch: RwLock<()>,
    comparator: C,
    hasher: H,
    _phantom: PhantomData<(K, V)>,
}

impl<K, V, C, H> ExtendibleHashTable<K, V, C, H>
where
    K: IndexKey,
    V: IndexValue,
    C: KeyComparator<K>,
    H: KeyHasher<K>,
{
    /// Create a new hash table with one empty bucket
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: C,
        hasher: H,
    ) -> Result<Self, HashIndexError> {
        let (directory_page, directory_page_id) = buffer_pool.new_page()?;
        let (_bucket_page, bucket_page_id) = buffer_pool.new_page()?;

        let mut directory = DirectoryPage::new();
        directory.set_bucket_page_id(0, bucket_page_id);
        directory.set_local_depth(0, 0);

        {
            let mut page_guard = directory_page.write();
            directory.write_to(&mut page_guard);
        }

        buffer_pool.unpin_page(directory_page_id, true)?;
        // A zeroed page is a valid empty bucket (both bitmaps clear)
        buffer_pool.unpin_page(bucket_page_id, false)?;

        Ok(Self {
            buffer_pool,
            directory_page_id,
            table_latch: RwLock::new(()),
            comparator,
            hasher,
            _phantom: PhantomData,
        })
    }

    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    /// Return all values stored under `key`; empty when none
    pub fn get_value(&self, key: &K) -> Vec<V> {
        let _table_guard = self.table_latch.read();
        match self.get_value_inner(key) {
            Ok(values) => values,
            Err(e) => {
                warn!("hash index lookup failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Insert the (key, value) pair.
    ///
    /// Returns false iff the exact pair is already present or the buffer
    /// pool could not supply the pages a split needed.
    pub fn insert(&self, key: &K, value: &V) -> bool {
        match self.try_insert(key, value) {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!("hash index insert failed: {}", e);
                false
            }
        }
    }

    /// Remove the (key, value) pair; returns false iff absent
    pub fn remove(&self, key: &K, value: &V) -> bool {
        match self.try_remove(key, value) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("hash index remove failed: {}", e);
                false
            }
        }
    }

    pub fn get_global_depth(&self) -> u32 {
        let _table_guard = self.table_latch.read();
        match self.read_directory() {
            Ok(directory) => directory.global_depth(),
            Err(e) => {
                warn!("could not read hash directory: {}", e);
                0
            }
        }
    }

    /// Check the directory invariants, reporting a violation as
    /// `CorruptDirectory`
    pub fn verify_integrity(&self) -> Result<(), HashIndexError> {
        let _table_guard = self.table_latch.read();
        let directory = self.read_directory()?;
        directory.verify_integrity()
    }

    fn hash(&self, key: &K) -> u32 {
        self.hasher.hash_key(key)
    }

    /// Fetch and decode the directory page; the pin is released before
    /// returning
    fn read_directory(&self) -> Result<DirectoryPage, BufferPoolError> {
        let page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let directory = {
            let page_guard = page.read();
            DirectoryPage::from_page(&page_guard)
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(directory)
    }

    /// Encode the directory back onto its page
    fn write_directory(&self, directory: &DirectoryPage) -> Result<(), BufferPoolError> {
        let page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        {
            let mut page_guard = page.write();
            directory.write_to(&mut page_guard);
        }
        self.buffer_pool.unpin_page(self.directory_page_id, true)?;
        Ok(())
    }

    fn fetch_bucket(&self, bucket_page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        self.buffer_pool.fetch_page(bucket_page_id)
    }

    fn get_value_inner(&self, key: &K) -> Result<Vec<V>, BufferPoolError> {
        let directory = self.read_directory()?;
        let bucket_idx = directory.hash_to_bucket_index(self.hash(key));
        let bucket_page_id = directory.bucket_page_id(bucket_idx);

        let page = self.fetch_bucket(bucket_page_id)?;
        let values = {
            let page_guard = page.read();
            let bucket = BucketPage::<K, V>::from_page(&page_guard);
            bucket.get_value(key, &self.comparator)
        };
        self.buffer_pool.unpin_page(bucket_page_id, false)?;

        Ok(values)
    }

    fn try_insert(&self, key: &K, value: &V) -> Result<bool, BufferPoolError> {
        {
            let _table_guard = self.table_latch.read();

            let directory = self.read_directory()?;
            let bucket_idx = directory.hash_to_bucket_index(self.hash(key));
            let bucket_page_id = directory.bucket_page_id(bucket_idx);

            let page = self.fetch_bucket(bucket_page_id)?;
            let (inserted, full) = {
                let mut page_guard = page.write();
                let mut bucket = BucketPage::<K, V>::from_page(&page_guard);
                let inserted = bucket.insert(key, value, &self.comparator);
                if inserted {
                    bucket.write_to(&mut page_guard);
                }
                (inserted, bucket.is_full())
            };

            if inserted {
                self.buffer_pool.unpin_page(bucket_page_id, true)?;
                return Ok(true);
            }
            self.buffer_pool.unpin_page(bucket_page_id, false)?;
            if !full {
                // The exact pair is already present
                return Ok(false);
            }
            // Bucket is full: fall through to the split path with all
            // shared latches released
        }

        self.split_insert(key, value)
    }

    /// Split the target bucket under the exclusive table latch, then
    /// retry the insert from the top.
    fn split_insert(&self, key: &K, value: &V) -> Result<bool, BufferPoolError> {
        {
            let _table_guard = self.table_latch.write();

            let mut directory = self.read_directory()?;
            let bucket_idx = directory.hash_to_bucket_index(self.hash(key));
            let bucket_page_id = directory.bucket_page_id(bucket_idx);

            let page = self.fetch_bucket(bucket_page_id)?;

            // The bucket may have changed while we waited for the
            // exclusive latch; try the plain insert once more
            let (inserted, full) = {
                let mut page_guard = page.write();
                let mut bucket = BucketPage::<K, V>::from_page(&page_guard);
                let inserted = bucket.insert(key, value, &self.comparator);
                if inserted {
                    bucket.write_to(&mut page_guard);
                }
                (inserted, bucket.is_full())
            };
            if inserted {
                self.buffer_pool.unpin_page(bucket_page_id, true)?;
                return Ok(true);
            }
            if !full {
                self.buffer_pool.unpin_page(bucket_page_id, false)?;
                return Ok(false);
            }

            let (new_page, new_bucket_page_id) = match self.buffer_pool.new_page() {
                Ok(pair) => pair,
                Err(e) => {
                    self.buffer_pool.unpin_page(bucket_page_id, false)?;
                    return Err(e);
                }
            };

            if directory.local_depth(bucket_idx) == directory.global_depth() {
                directory.incr_global_depth();
            }

            let old_depth = directory.local_depth(bucket_idx);
            let new_depth = old_depth + 1;

            // Deepen every slot that shared the old bucket
            let old_step = 1usize << old_depth;
            let mut i = bucket_idx & (old_step - 1);
            while i < directory.size() {
                directory.incr_local_depth(i);
                i += old_step;
            }

            // Slots matching the newly significant bit of bucket_idx now
            // point at the fresh bucket; the sibling class keeps the old one
            let new_step = 1usize << new_depth;
            let new_mask = new_step - 1;
            let mut i = bucket_idx & new_mask;
            while i < directory.size() {
                directory.set_bucket_page_id(i, new_bucket_page_id);
                i += new_step;
            }

            // Rehash the old bucket's entries, old latch before new
            let moved = {
                let mut old_guard = page.write();
                let mut new_guard = new_page.write();
                let mut old_bucket = BucketPage::<K, V>::from_page(&old_guard);
                let mut new_bucket = BucketPage::<K, V>::from_page(&new_guard);

                let mut moved = false;
                for slot in 0..BucketPage::<K, V>::capacity() {
                    let entry = old_bucket.entry_at(slot).cloned();
                    if let Some((stored_key, stored_value)) = entry {
                        let stored_hash = self.hash(&stored_key) as usize;
                        if stored_hash & new_mask == bucket_idx & new_mask {
                            new_bucket.insert(&stored_key, &stored_value, &self.comparator);
                            old_bucket.remove_at(slot);
                            moved = true;
                        }
                    }
                }
                if moved {
                    old_bucket.write_to(&mut old_guard);
                    new_bucket.write_to(&mut new_guard);
                }
                moved
            };

            debug!(
                "split bucket {} into {} at local depth {} (global depth {})",
                bucket_page_id,
                new_bucket_page_id,
                new_depth,
                directory.global_depth()
            );

            self.write_directory(&directory)?;
            self.buffer_pool.unpin_page(new_bucket_page_id, moved)?;
            self.buffer_pool.unpin_page(bucket_page_id, moved)?;
        }

        // All entries may have rehashed to one side; retry from the top
        self.try_insert(key, value)
    }

    fn try_remove(&self, key: &K, value: &V) -> Result<bool, BufferPoolError> {
        let (removed, now_empty) = {
            let _table_guard = self.table_latch.read();

            let directory = self.read_directory()?;
            let bucket_idx = directory.hash_to_bucket_index(self.hash(key));
            let bucket_page_id = directory.bucket_page_id(bucket_idx);

            let page = self.fetch_bucket(bucket_page_id)?;
            let (removed, now_empty) = {
                let mut page_guard = page.write();
                let mut bucket = BucketPage::<K, V>::from_page(&page_guard);
                let removed = bucket.remove(key, value, &self.comparator);
                if removed {
                    bucket.write_to(&mut page_guard);
                }
                (removed, bucket.is_empty())
            };
            self.buffer_pool.unpin_page(bucket_page_id, removed)?;
            (removed, now_empty)
        };

        if now_empty {
            // The merge's outcome never changes the removal result
            if let Err(e) = self.merge(key) {
                warn!("bucket merge failed: {}", e);
            }
        }

        Ok(removed)
    }

    /// Fold an empty bucket into its split image and shrink the
    /// directory as far as the local depths allow. Single-pass: one
    /// empty bucket triggers at most one merge.
    fn merge(&self, key: &K) -> Result<(), BufferPoolError> {
        let _table_guard = self.table_latch.write();

        // Re-read the slot: the bucket may have moved or changed depth
        // since the remove released its latches
        let mut directory = self.read_directory()?;
        let bucket_idx = directory.hash_to_bucket_index(self.hash(key));
        let bucket_page_id = directory.bucket_page_id(bucket_idx);
        let local_depth = directory.local_depth(bucket_idx);

        if local_depth == 0 {
            return Ok(());
        }

        let image_idx = bucket_idx ^ (1usize << (local_depth - 1));
        if directory.local_depth(image_idx) != local_depth {
            return Ok(());
        }

        // A concurrent insert may have refilled the bucket before we took
        // the exclusive latch
        let page = self.fetch_bucket(bucket_page_id)?;
        let still_empty = {
            let page_guard = page.read();
            BucketPage::<K, V>::from_page(&page_guard).is_empty()
        };
        self.buffer_pool.unpin_page(bucket_page_id, false)?;
        if !still_empty {
            return Ok(());
        }

        // Point the union of both equivalence classes at the image and
        // shallow them by one bit
        let image_page_id = directory.bucket_page_id(image_idx);
        let step = 1usize << (local_depth - 1);
        let mut i = bucket_idx & (step - 1);
        while i < directory.size() {
            directory.set_bucket_page_id(i, image_page_id);
            directory.decr_local_depth(i);
            i += step;
        }

        if let Err(e) = self.buffer_pool.delete_page(bucket_page_id) {
            warn!("could not free merged bucket page {}: {}", bucket_page_id, e);
        }

        while directory.can_shrink() {
            directory.decr_global_depth();
        }

        debug!(
            "merged bucket {} into {} (global depth {})",
            bucket_page_id,
            image_page_id,
            directory.global_depth()
        );

        self.write_directory(&directory)
    }
}
