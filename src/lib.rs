// Export public modules
pub mod common;
pub mod container;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use container::hash::ExtendibleHashTable;
pub use index::btree::{BTreeIndex, BTreeIterator};
pub use storage::buffer::{BufferPoolError, BufferPoolManager, LruKReplacer};
pub use storage::disk::DiskManager;
pub use storage::page::PageError;
pub use transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionAbortError,
    TransactionManager,
};
