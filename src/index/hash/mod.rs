pub mod bucket;
pub mod directory;
pub mod error;
pub mod key;
pub mod table;

pub use error::HashIndexError;
pub use table::ExtendibleHashTable;
