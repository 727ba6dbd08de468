use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, INVALID_PAGE_ID};
use crate::index::hash::error::HashIndexError;

/// Upper bound on the global depth; the directory never outgrows one page
pub const MAX_GLOBAL_DEPTH: u32 = 9;

/// Number of directory slots persisted on the page (2^MAX_GLOBAL_DEPTH)
pub const DIRECTORY_ARRAY_SIZE: usize = 1 << MAX_GLOBAL_DEPTH;

const GLOBAL_DEPTH_OFFSET: usize = 0;
const BUCKET_IDS_OFFSET: usize = 4;
const LOCAL_DEPTHS_OFFSET: usize = BUCKET_IDS_OFFSET + 4 * DIRECTORY_ARRAY_SIZE;

/// In-memory view of the extendible hash directory page.
///
/// Layout: `global_depth` (u32), then `DIRECTORY_ARRAY_SIZE` bucket page
/// ids (u32 each), then the same number of local depths (u8 each). Only
/// the first `2^global_depth` slots are meaningful.
#[derive(Debug, Clone)]
pub struct DirectoryPage {
    global_depth: u32,
    bucket_page_ids: [PageId; DIRECTORY_ARRAY_SIZE],
    local_depths: [u8; DIRECTORY_ARRAY_SIZE],
}

impl Default for DirectoryPage {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryPage {
    pub fn new() -> Self {
        Self {
            global_depth: 0,
            bucket_page_ids: [INVALID_PAGE_ID; DIRECTORY_ARRAY_SIZE],
            local_depths: [0; DIRECTORY_ARRAY_SIZE],
        }
    }

    /// Decode the directory from page bytes
    pub fn from_page(page: &Page) -> Self {
        let global_depth = LittleEndian::read_u32(&page.data[GLOBAL_DEPTH_OFFSET..]);

        let mut bucket_page_ids = [INVALID_PAGE_ID; DIRECTORY_ARRAY_SIZE];
        for (i, id) in bucket_page_ids.iter_mut().enumerate() {
            *id = LittleEndian::read_u32(&page.data[BUCKET_IDS_OFFSET + 4 * i..]);
        }

        let mut local_depths = [0u8; DIRECTORY_ARRAY_SIZE];
        local_depths
            .copy_from_slice(&page.data[LOCAL_DEPTHS_OFFSET..LOCAL_DEPTHS_OFFSET + DIRECTORY_ARRAY_SIZE]);

        Self {
            global_depth,
            bucket_page_ids,
            local_depths,
        }
    }

    /// Encode the directory into page bytes
    pub fn write_to(&self, page: &mut Page) {
        LittleEndian::write_u32(
            &mut page.data[GLOBAL_DEPTH_OFFSET..GLOBAL_DEPTH_OFFSET + 4],
            self.global_depth,
        );

        for (i, &id) in self.bucket_page_ids.iter().enumerate() {
            let offset = BUCKET_IDS_OFFSET + 4 * i;
            LittleEndian::write_u32(&mut page.data[offset..offset + 4], id);
        }

        page.data[LOCAL_DEPTHS_OFFSET..LOCAL_DEPTHS_OFFSET + DIRECTORY_ARRAY_SIZE]
            .copy_from_slice(&self.local_depths);
    }

    pub fn global_depth(&self) -> u32 {
        self.global_depth
    }

    /// Mask of `global_depth` low one-bits
    pub fn global_depth_mask(&self) -> u32 {
        (1u32 << self.global_depth) - 1
    }

    /// Current number of directory slots (2^global_depth)
    pub fn size(&self) -> usize {
        1 << self.global_depth
    }

    /// Directory slot a hash value indexes into
    pub fn hash_to_bucket_index(&self, hash: u32) -> usize {
        (hash & self.global_depth_mask()) as usize
    }

    pub fn bucket_page_id(&self, bucket_idx: usize) -> PageId {
        self.bucket_page_ids[bucket_idx]
    }

    pub fn set_bucket_page_id(&mut self, bucket_idx: usize, bucket_page_id: PageId) {
        self.bucket_page_ids[bucket_idx] = bucket_page_id;
    }

    pub fn local_depth(&self, bucket_idx: usize) -> u32 {
        self.local_depths[bucket_idx] as u32
    }

    pub fn set_local_depth(&mut self, bucket_idx: usize, local_depth: u32) {
        debug_assert!(local_depth <= self.global_depth);
        self.local_depths[bucket_idx] = local_depth as u8;
    }

    pub fn incr_local_depth(&mut self, bucket_idx: usize) {
        self.local_depths[bucket_idx] += 1;
    }

    pub fn decr_local_depth(&mut self, bucket_idx: usize) {
        self.local_depths[bucket_idx] -= 1;
    }

    /// Double the directory, replicating the existing slots into the
    /// upper half
    pub fn incr_global_depth(&mut self) {
        assert!(
            self.global_depth < MAX_GLOBAL_DEPTH,
            "directory is at maximum depth"
        );
        let old_size = self.size();
        for i in 0..old_size {
            self.bucket_page_ids[old_size + i] = self.bucket_page_ids[i];
            self.local_depths[old_size + i] = self.local_depths[i];
        }
        self.global_depth += 1;
    }

    /// Halve the directory
    pub fn decr_global_depth(&mut self) {
        assert!(self.global_depth > 0, "directory cannot shrink below one slot");
        self.global_depth -= 1;
    }

    /// The directory may halve when no bucket uses its full depth
    pub fn can_shrink(&self) -> bool {
        if self.global_depth == 0 {
            return false;
        }
        (0..self.size()).all(|i| self.local_depth(i) < self.global_depth)
    }

    /// Check the structural invariants of the directory: every local
    /// depth is bounded by the global depth, and all slots sharing the
    /// low `local_depth` bits point at the same bucket with the same
    /// depth.
    pub fn verify_integrity(&self) -> Result<(), HashIndexError> {
        for i in 0..self.size() {
            let ld = self.local_depth(i);
            if ld > self.global_depth {
                return Err(HashIndexError::CorruptDirectory(format!(
                    "local depth {} of slot {} exceeds global depth {}",
                    ld, i, self.global_depth
                )));
            }

            let step = 1usize << ld;
            let class_head = i & (step - 1);
            let mut j = class_head;
            while j < self.size() {
                if self.bucket_page_id(j) != self.bucket_page_id(i) {
                    return Err(HashIndexError::CorruptDirectory(format!(
                        "slots {} and {} share low {} bits but point at different buckets",
                        i, j, ld
                    )));
                }
                if self.local_depth(j) != ld {
                    return Err(HashIndexError::CorruptDirectory(format!(
                        "slots {} and {} share a bucket but disagree on local depth",
                        i, j
                    )));
                }
                j += step;
            }
        }
        Ok(())
    }
}
