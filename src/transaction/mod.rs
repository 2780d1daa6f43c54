pub mod concurrency;

pub use concurrency::lock_manager::{
    AbortReason, LockManager, LockMode, TransactionAbortError,
};
pub use concurrency::transaction_manager::TransactionManager;
pub use concurrency::{IsolationLevel, Transaction, TransactionError, TransactionState};
