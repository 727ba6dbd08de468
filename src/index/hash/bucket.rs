use crate::common::types::{Page, PAGE_SIZE};
use crate::index::hash::key::{IndexKey, IndexValue, KeyComparator};

const fn bitmap_bytes(capacity: usize) -> usize {
    (capacity + 7) / 8
}

/// Number of (key, value) slots that fit in a bucket page alongside the
/// two slot bitmaps
pub const fn bucket_capacity(pair_size: usize) -> usize {
    let mut capacity = (4 * PAGE_SIZE) / (4 * pair_size + 1);
    while 2 * bitmap_bytes(capacity) + capacity * pair_size > PAGE_SIZE {
        capacity -= 1;
    }
    capacity
}

/// In-memory view of one hash bucket page.
///
/// Layout: `occupied` bitmap, `readable` bitmap (each `ceil(N/8)` bytes),
/// then `N` fixed-size (key, value) pairs. A slot is live iff its
/// `readable` bit is set; `occupied` without `readable` is a tombstone
/// that keeps linear probes running past it.
pub struct BucketPage<K, V> {
    capacity: usize,
    occupied: Vec<u8>,
    readable: Vec<u8>,
    slots: Vec<Option<(K, V)>>,
}

impl<K: IndexKey, V: IndexValue> BucketPage<K, V> {
    pub const fn capacity() -> usize {
        bucket_capacity(K::ENCODED_SIZE + V::ENCODED_SIZE)
    }

    /// Decode a bucket from page bytes
    pub fn from_page(page: &Page) -> Self {
        let capacity = Self::capacity();
        let bitmap_len = bitmap_bytes(capacity);
        let pair_size = K::ENCODED_SIZE + V::ENCODED_SIZE;
        let pairs_offset = 2 * bitmap_len;

        let occupied = page.data[0..bitmap_len].to_vec();
        let readable = page.data[bitmap_len..2 * bitmap_len].to_vec();

        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            if readable[i / 8] & (1 << (i % 8)) != 0 {
                let offset = pairs_offset + i * pair_size;
                let key = K::decode(&page.data[offset..offset + K::ENCODED_SIZE]);
                let value = V::decode(
                    &page.data[offset + K::ENCODED_SIZE..offset + pair_size],
                );
                slots.push(Some((key, value)));
            } else {
                slots.push(None);
            }
        }

        Self {
            capacity,
            occupied,
            readable,
            slots,
        }
    }

    /// Encode the bucket back into page bytes
    pub fn write_to(&self, page: &mut Page) {
        let bitmap_len = bitmap_bytes(self.capacity);
        let pair_size = K::ENCODED_SIZE + V::ENCODED_SIZE;
        let pairs_offset = 2 * bitmap_len;

        page.data[0..bitmap_len].copy_from_slice(&self.occupied);
        page.data[bitmap_len..2 * bitmap_len].copy_from_slice(&self.readable);

        for (i, slot) in self.slots.iter().enumerate() {
            let offset = pairs_offset + i * pair_size;
            match slot {
                Some((key, value)) => {
                    key.encode(&mut page.data[offset..offset + K::ENCODED_SIZE]);
                    value.encode(
                        &mut page.data[offset + K::ENCODED_SIZE..offset + pair_size],
                    );
                }
                None => {
                    page.data[offset..offset + pair_size].fill(0);
                }
            }
        }
    }

    /// Collect all values stored under `key`
    pub fn get_value<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> Vec<V> {
        let mut result = Vec::new();
        for i in 0..self.capacity {
            if !self.is_occupied(i) {
                break;
            }
            if let Some((stored_key, stored_value)) = &self.slots[i] {
                if comparator.compare(stored_key, key).is_eq() {
                    result.push(stored_value.clone());
                }
            }
        }
        result
    }

    /// Insert a pair into the first free slot.
    ///
    /// Returns false if the exact (key, value) pair is already present or
    /// if no slot is free; `is_full` distinguishes the two for the caller.
    pub fn insert<C: KeyComparator<K>>(&mut self, key: &K, value: &V, comparator: &C) -> bool {
        let mut first_free = None;
        for i in 0..self.capacity {
            if let Some((stored_key, stored_value)) = &self.slots[i] {
                if comparator.compare(stored_key, key).is_eq() && stored_value == value {
                    return false;
                }
            } else {
                if first_free.is_none() {
                    first_free = Some(i);
                }
                if !self.is_occupied(i) {
                    break;
                }
            }
        }

        match first_free {
            Some(i) => {
                self.slots[i] = Some((key.clone(), value.clone()));
                self.set_occupied(i);
                self.set_readable(i);
                true
            }
            None => false,
        }
    }

    /// Remove the exact (key, value) pair; returns false if absent
    pub fn remove<C: KeyComparator<K>>(&mut self, key: &K, value: &V, comparator: &C) -> bool {
        for i in 0..self.capacity {
            if !self.is_occupied(i) {
                break;
            }
            let matches = match &self.slots[i] {
                Some((stored_key, stored_value)) => {
                    comparator.compare(stored_key, key).is_eq() && stored_value == value
                }
                None => false,
            };
            if matches {
                self.remove_at(i);
                return true;
            }
        }
        false
    }

    /// Tombstone a slot: the readable bit is cleared, the occupied bit
    /// stays so probes keep scanning past it
    pub fn remove_at(&mut self, slot: usize) {
        self.readable[slot / 8] &= !(1 << (slot % 8));
        self.slots[slot] = None;
    }

    pub fn entry_at(&self, slot: usize) -> Option<&(K, V)> {
        self.slots[slot].as_ref()
    }

    pub fn num_readable(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.num_readable() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.num_readable() == 0
    }

    fn is_occupied(&self, slot: usize) -> bool {
        self.occupied[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn set_occupied(&mut self, slot: usize) {
        self.occupied[slot / 8] |= 1 << (slot % 8);
    }

    fn set_readable(&mut self, slot: usize) {
        self.readable[slot / 8] |= 1 << (slot % 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hash::key::OrdComparator;

    fn empty_bucket() -> BucketPage<i32, i32> {
        BucketPage::from_page(&Page::new(0))
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut bucket = empty_bucket();
        let cmp = OrdComparator;

        assert!(bucket.insert(&1, &10, &cmp));
        assert!(bucket.insert(&1, &11, &cmp));
        assert!(bucket.insert(&2, &20, &cmp));

        let mut values = bucket.get_value(&1, &cmp);
        values.sort();
        assert_eq!(values, vec![10, 11]);
        assert_eq!(bucket.get_value(&3, &cmp), Vec::<i32>::new());
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let mut bucket = empty_bucket();
        let cmp = OrdComparator;

        assert!(bucket.insert(&1, &10, &cmp));
        assert!(!bucket.insert(&1, &10, &cmp));
        assert_eq!(bucket.num_readable(), 1);
    }

    #[test]
    fn test_tombstone_keeps_probe_running() {
        let mut bucket = empty_bucket();
        let cmp = OrdComparator;

        assert!(bucket.insert(&1, &10, &cmp));
        assert!(bucket.insert(&2, &20, &cmp));
        assert!(bucket.remove(&1, &10, &cmp));

        // Entry behind the tombstone is still reachable
        assert_eq!(bucket.get_value(&2, &cmp), vec![20]);
        // The tombstoned slot is reused
        assert!(bucket.insert(&3, &30, &cmp));
        assert_eq!(bucket.get_value(&3, &cmp), vec![30]);
    }

    #[test]
    fn test_fill_to_capacity() {
        let mut bucket = empty_bucket();
        let cmp = OrdComparator;
        let capacity = BucketPage::<i32, i32>::capacity();

        for i in 0..capacity as i32 {
            assert!(bucket.insert(&i, &i, &cmp));
        }
        assert!(bucket.is_full());
        assert!(!bucket.insert(&-1, &-1, &cmp));
    }

    #[test]
    fn test_page_round_trip() {
        let mut bucket = empty_bucket();
        let cmp = OrdComparator;
        bucket.insert(&5, &50, &cmp);
        bucket.insert(&6, &60, &cmp);
        bucket.remove(&5, &50, &cmp);

        let mut page = Page::new(0);
        bucket.write_to(&mut page);
        let decoded = BucketPage::<i32, i32>::from_page(&page);

        assert_eq!(decoded.get_value(&6, &cmp), vec![60]);
        assert!(decoded.get_value(&5, &cmp).is_empty());
        assert_eq!(decoded.num_readable(), 1);
    }
}
