// Export public modules
pub mod common;
pub mod storage;
pub mod index;
pub mod transaction;

// Re-export key items for convenient access
pub use storage::buffer::BufferPoolManager;
pub use storage::buffer::ParallelBufferPoolManager;
pub use storage::buffer::BufferPoolError;
pub use index::hash::ExtendibleHashTable;
pub use transaction::{LockManager, Transaction, TransactionManager};
