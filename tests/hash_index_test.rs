use std::sync::Arc;
use std::thread;
use anyhow::Result;

mod common;
use common::create_test_buffer_pool;

use shaledb::index::hash::bucket::BucketPage;
use shaledb::index::hash::key::{KeyHasher, OrdComparator, DefaultKeyHasher};
use shaledb::index::hash::ExtendibleHashTable;
use shaledb::storage::buffer::BufferPoolManager;
use tempfile::NamedTempFile;

/// Hashes an i32 key to itself, making bucket placement predictable
#[derive(Debug, Clone, Copy, Default)]
struct IdentityHasher;

impl KeyHasher<i32> for IdentityHasher {
    fn hash_key(&self, key: &i32) -> u32 {
        *key as u32
    }
}

type TestTable = ExtendibleHashTable<i32, i32, OrdComparator, IdentityHasher>;

fn create_test_table(
    pool_size: usize,
) -> Result<(TestTable, Arc<BufferPoolManager>, NamedTempFile)> {
    let (buffer_pool, temp_file) = create_test_buffer_pool(pool_size)?;
    let table = ExtendibleHashTable::new(buffer_pool.clone(), OrdComparator, IdentityHasher)?;
    Ok((table, buffer_pool, temp_file))
}

const BUCKET_CAPACITY: usize = BucketPage::<i32, i32>::capacity();

#[test]
fn test_round_trip_small() -> Result<()> {
    let (table, _pool, _temp_file) = create_test_table(16)?;

    for i in 0..5 {
        assert!(table.insert(&i, &i));
    }
    assert_eq!(table.get_global_depth(), 0);

    for i in 0..5 {
        assert_eq!(table.get_value(&i), vec![i]);
    }

    for i in 0..5 {
        assert!(table.remove(&i, &i));
        assert!(table.get_value(&i).is_empty());
    }
    table.verify_integrity()?;

    Ok(())
}

#[test]
fn test_duplicate_rejection() -> Result<()> {
    let (table, _pool, _temp_file) = create_test_table(16)?;

    assert!(table.insert(&0, &0));
    // The exact pair is rejected
    assert!(!table.insert(&0, &0));
    // The same key with a different value is fine
    assert!(table.insert(&0, &1));

    let mut values = table.get_value(&0);
    values.sort();
    assert_eq!(values, vec![0, 1]);

    Ok(())
}

#[test]
fn test_remove_absent_pair() -> Result<()> {
    let (table, _pool, _temp_file) = create_test_table(16)?;

    assert!(!table.remove(&1, &1));
    assert!(table.insert(&1, &1));
    // Same key, different value: not the stored pair
    assert!(!table.remove(&1, &2));
    assert!(table.remove(&1, &1));

    Ok(())
}

#[test]
fn test_forced_split() -> Result<()> {
    let (table, _pool, _temp_file) = create_test_table(32)?;

    // Filling one bucket exactly does not split
    for i in 0..BUCKET_CAPACITY as i32 {
        assert!(table.insert(&i, &i));
    }
    assert_eq!(table.get_global_depth(), 0);

    // One more insert forces the split
    let overflow_key = BUCKET_CAPACITY as i32;
    assert!(table.insert(&overflow_key, &overflow_key));
    assert_eq!(table.get_global_depth(), 1);
    table.verify_integrity()?;

    // Every key is still reachable
    for i in 0..=BUCKET_CAPACITY as i32 {
        assert_eq!(table.get_value(&i), vec![i], "key {} lost after split", i);
    }

    Ok(())
}

#[test]
fn test_merge_and_directory_shrink() -> Result<()> {
    let (table, _pool, _temp_file) = create_test_table(32)?;

    // Force a split as above
    for i in 0..=BUCKET_CAPACITY as i32 {
        assert!(table.insert(&i, &i));
    }
    assert_eq!(table.get_global_depth(), 1);

    // Drain the even bucket; its last removal merges it back into its
    // image and the directory shrinks to a single slot
    for i in (0..=BUCKET_CAPACITY as i32).filter(|i| i % 2 == 0) {
        assert!(table.remove(&i, &i));
    }
    assert_eq!(table.get_global_depth(), 0);
    table.verify_integrity()?;

    // Odd keys survived the merge
    for i in (0..=BUCKET_CAPACITY as i32).filter(|i| i % 2 == 1) {
        assert_eq!(table.get_value(&i), vec![i], "key {} lost after merge", i);
    }

    Ok(())
}

#[test]
fn test_insert_then_remove_is_identity() -> Result<()> {
    let (table, _pool, _temp_file) = create_test_table(16)?;

    assert!(table.insert(&7, &70));

    assert!(table.insert(&3, &30));
    assert!(table.remove(&3, &30));

    assert_eq!(table.get_value(&3), Vec::<i32>::new());
    assert_eq!(table.get_value(&7), vec![70]);
    table.verify_integrity()?;

    Ok(())
}

#[test]
fn test_default_hasher_end_to_end() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let table: ExtendibleHashTable<u64, u64, OrdComparator, DefaultKeyHasher> =
        ExtendibleHashTable::new(buffer_pool, OrdComparator, DefaultKeyHasher)?;

    for i in 0..500u64 {
        assert!(table.insert(&i, &(i * 10)));
    }
    table.verify_integrity()?;

    for i in 0..500u64 {
        assert_eq!(table.get_value(&i), vec![i * 10]);
    }
    for i in 0..500u64 {
        assert!(table.remove(&i, &(i * 10)));
    }
    for i in 0..500u64 {
        assert!(table.get_value(&i).is_empty());
    }
    table.verify_integrity()?;

    Ok(())
}

#[test]
fn test_generic_keys_with_rids() -> Result<()> {
    use shaledb::common::types::Rid;
    use shaledb::index::hash::key::GenericKey;

    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let table: ExtendibleHashTable<GenericKey<8>, Rid, OrdComparator, DefaultKeyHasher> =
        ExtendibleHashTable::new(buffer_pool, OrdComparator, DefaultKeyHasher)?;

    let key = GenericKey::<8>::from_bytes(b"user_42");
    let rid_a = Rid::new(12, 3);
    let rid_b = Rid::new(12, 4);

    assert!(table.insert(&key, &rid_a));
    assert!(table.insert(&key, &rid_b));
    assert!(!table.insert(&key, &rid_a));

    let mut rids = table.get_value(&key);
    rids.sort();
    assert_eq!(rids, vec![rid_a, rid_b]);

    assert!(table.remove(&key, &rid_a));
    assert_eq!(table.get_value(&key), vec![rid_b]);

    Ok(())
}

#[test]
fn test_concurrent_inserts() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let table: Arc<ExtendibleHashTable<u64, u64, OrdComparator, DefaultKeyHasher>> = Arc::new(
        ExtendibleHashTable::new(buffer_pool, OrdComparator, DefaultKeyHasher)?,
    );

    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 200;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let table = table.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let key = t * PER_THREAD + i;
                assert!(table.insert(&key, &key));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    table.verify_integrity()?;
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(table.get_value(&key), vec![key], "key {} lost", key);
    }

    Ok(())
}
