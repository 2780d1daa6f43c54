use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Errors from transaction lifecycle management
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TxnId),

    #[error("Transaction {0} is already committed or aborted")]
    NotActive(TxnId),
}

/// An active transaction.
///
/// State and held-lock bookkeeping sit behind their own locks: the owning
/// thread drives the transaction, but the lock manager mutates the held
/// sets while granting and the deadlock detector flips the state to
/// Aborted from its background thread.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,

    shared_table_locks: Mutex<HashSet<TableOid>>,
    exclusive_table_locks: Mutex<HashSet<TableOid>>,
    intention_shared_table_locks: Mutex<HashSet<TableOid>>,
    intention_exclusive_table_locks: Mutex<HashSet<TableOid>>,
    shared_intention_exclusive_table_locks: Mutex<HashSet<TableOid>>,

    shared_row_locks: Mutex<HashMap<TableOid, HashSet<Rid>>>,
    exclusive_row_locks: Mutex<HashMap<TableOid, HashSet<Rid>>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            shared_table_locks: Mutex::new(HashSet::new()),
            exclusive_table_locks: Mutex::new(HashSet::new()),
            intention_shared_table_locks: Mutex::new(HashSet::new()),
            intention_exclusive_table_locks: Mutex::new(HashSet::new()),
            shared_intention_exclusive_table_locks: Mutex::new(HashSet::new()),
            shared_row_locks: Mutex::new(HashMap::new()),
            exclusive_row_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    fn table_set(&self, mode: LockMode) -> &Mutex<HashSet<TableOid>> {
        match mode {
            LockMode::Shared => &self.shared_table_locks,
            LockMode::Exclusive => &self.exclusive_table_locks,
            LockMode::IntentionShared => &self.intention_shared_table_locks,
            LockMode::IntentionExclusive => &self.intention_exclusive_table_locks,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_table_locks,
        }
    }

    pub fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.table_set(mode).lock().insert(oid);
    }

    pub fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.table_set(mode).lock().remove(&oid);
    }

    pub fn holds_table_lock(&self, mode: LockMode, oid: TableOid) -> bool {
        self.table_set(mode).lock().contains(&oid)
    }

    pub fn holds_table_lock_in(&self, oid: TableOid, modes: &[LockMode]) -> bool {
        modes.iter().any(|&mode| self.holds_table_lock(mode, oid))
    }

    pub fn holds_any_table_lock(&self, oid: TableOid) -> bool {
        self.holds_table_lock_in(
            oid,
            &[
                LockMode::IntentionShared,
                LockMode::Shared,
                LockMode::IntentionExclusive,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
        )
    }

    fn row_map(&self, mode: LockMode) -> &Mutex<HashMap<TableOid, HashSet<Rid>>> {
        match mode {
            LockMode::Shared => &self.shared_row_locks,
            LockMode::Exclusive => &self.exclusive_row_locks,
            _ => unreachable!("intention locks are table-level only"),
        }
    }

    pub fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        self.row_map(mode).lock().entry(oid).or_default().insert(rid);
    }

    pub fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut rows = self.row_map(mode).lock();
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    /// Does the transaction still hold any row lock on this table?
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let holds = |rows: &HashMap<TableOid, HashSet<Rid>>| {
            rows.get(&oid).map_or(false, |set| !set.is_empty())
        };
        holds(&self.shared_row_locks.lock()) || holds(&self.exclusive_row_locks.lock())
    }

    /// Snapshot of every held table lock, for bulk release
    pub fn table_lock_snapshot(&self) -> Vec<(LockMode, TableOid)> {
        let mut out = Vec::new();
        for mode in [
            LockMode::IntentionShared,
            LockMode::Shared,
            LockMode::IntentionExclusive,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ] {
            for &oid in self.table_set(mode).lock().iter() {
                out.push((mode, oid));
            }
        }
        out
    }

    /// Snapshot of every held row lock, for bulk release
    pub fn row_lock_snapshot(&self) -> Vec<(LockMode, TableOid, Rid)> {
        let mut out = Vec::new();
        for mode in [LockMode::Shared, LockMode::Exclusive] {
            for (&oid, rids) in self.row_map(mode).lock().iter() {
                for &rid in rids {
                    out.push((mode, oid, rid));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::ReadCommitted);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_table_lock_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::RepeatableRead);
        txn.insert_table_lock(LockMode::IntentionExclusive, 7);
        assert!(txn.holds_table_lock(LockMode::IntentionExclusive, 7));
        assert!(txn.holds_any_table_lock(7));
        assert!(!txn.holds_any_table_lock(8));

        txn.remove_table_lock(LockMode::IntentionExclusive, 7);
        assert!(!txn.holds_any_table_lock(7));
    }

    #[test]
    fn test_row_lock_bookkeeping() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        let rid = Rid::new(4, 2);
        txn.insert_row_lock(LockMode::Exclusive, 7, rid);
        assert!(txn.holds_row_locks_on(7));

        txn.remove_row_lock(LockMode::Exclusive, 7, rid);
        assert!(!txn.holds_row_locks_on(7));
    }

    #[test]
    fn test_snapshots() {
        let txn = Transaction::new(4, IsolationLevel::ReadCommitted);
        txn.insert_table_lock(LockMode::IntentionExclusive, 1);
        txn.insert_table_lock(LockMode::Shared, 2);
        txn.insert_row_lock(LockMode::Exclusive, 1, Rid::new(1, 1));

        assert_eq!(txn.table_lock_snapshot().len(), 2);
        assert_eq!(txn.row_lock_snapshot().len(), 1);
    }
}
