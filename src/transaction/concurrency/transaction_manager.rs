use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Issues transaction ids and tracks active transactions. Commit and
/// abort hand every lock the transaction still holds back to the lock
/// manager; the deadlock detector reaches aborted victims through the
/// same shared handles.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction at the given isolation level
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    /// Commit: transition the state, then drop all held locks. A
    /// transaction the deadlock detector already aborted cannot commit;
    /// it stays registered until `abort` rolls it back.
    pub fn commit(&self, txn_id: TxnId) -> Result<(), TransactionError> {
        let txn = {
            let mut active = self.active_transactions.lock();
            let txn = active
                .get(&txn_id)
                .cloned()
                .ok_or(TransactionError::NotFound(txn_id))?;
            if matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            ) {
                return Err(TransactionError::NotActive(txn_id));
            }
            active.remove(&txn_id);
            txn
        };
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all_locks(&txn);
        Ok(())
    }

    /// Abort: mark the transaction and release everything it holds.
    /// Rolling back its writes is the executor layer's job.
    pub fn abort(&self, txn_id: TxnId) -> Result<(), TransactionError> {
        let txn = self
            .active_transactions
            .lock()
            .remove(&txn_id)
            .ok_or(TransactionError::NotFound(txn_id))?;
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(&txn);
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }
}
