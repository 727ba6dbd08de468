use std::sync::Arc;
use tempfile::NamedTempFile;
use anyhow::Result;

use shaledb::storage::buffer::{BufferPoolManager, ParallelBufferPoolManager};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path)?);
    Ok((buffer_pool, file))
}

// Create a parallel buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_parallel_pool(
    num_instances: u32,
    pool_size: usize,
) -> Result<(Arc<ParallelBufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let pool = Arc::new(ParallelBufferPoolManager::new(num_instances, pool_size, path)?);
    Ok((pool, file))
}

// Generate test data of specified size
#[allow(dead_code)]
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}
