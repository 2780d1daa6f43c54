pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;
mod wait_for_graph;

pub use lock_manager::{AbortReason, LockManager, LockMode, TransactionAbortError};
pub use transaction::{IsolationLevel, Transaction, TransactionError, TransactionState};
pub use transaction_manager::TransactionManager;
