use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::transaction::{IsolationLevel, Transaction, TransactionState};
use crate::transaction::concurrency::wait_for_graph::WaitForGraph;

/// Multi-granularity lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    Shared,
    IntentionExclusive,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// May a request in this mode coexist with an already-granted request
    /// in `granted`?
    pub fn compatible_with(self, granted: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => !matches!(granted, Exclusive),
            Shared => !matches!(granted, IntentionExclusive | SharedIntentionExclusive | Exclusive),
            IntentionExclusive => !matches!(granted, Shared | SharedIntentionExclusive | Exclusive),
            SharedIntentionExclusive => matches!(granted, IntentionShared),
            Exclusive => false,
        }
    }

    /// Strict upgrades only: IS < {S, IX} < SIX < X
    pub fn can_upgrade_to(self, target: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                target,
                Shared | IntentionExclusive | SharedIntentionExclusive | Exclusive
            ),
            Shared | IntentionExclusive => matches!(target, SharedIntentionExclusive | Exclusive),
            SharedIntentionExclusive => matches!(target, Exclusive),
            Exclusive => false,
        }
    }
}

/// Why a lock request aborted its transaction
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while in the shrinking phase")]
    LockOnShrinking,
    #[error("shared-family lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,
    #[error("requested mode is not a strict upgrade of the held mode")]
    IncompatibleUpgrade,
    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,
    #[error("row lock requested without a compatible table lock")]
    TableLockNotPresent,
    #[error("unlock requested but no lock is held")]
    AttemptedUnlockButNoLockHeld,
    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,
}

/// Policy violation: the transaction has already been moved to Aborted
/// when this surfaces.
#[derive(Error, Debug)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    oid: TableOid,
    rid: Option<Rid>,
    granted: bool,
}

struct QueueState {
    queue: Vec<LockRequest>,
    /// Transaction currently upgrading on this resource, if any
    upgrading: Option<TxnId>,
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: Vec::new(),
                upgrading: None,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Table- and row-granularity lock manager with FIFO writer fairness,
/// reader coalescing, strict upgrades, and a background deadlock detector
/// that aborts the youngest transaction on each cycle.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    cycle_detection_interval: Duration,
    cycle_detection_enabled: AtomicBool,
}

impl LockManager {
    pub fn new(cycle_detection_interval: Duration) -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            cycle_detection_interval,
            cycle_detection_enabled: AtomicBool::new(true),
        }
    }

    /// Acquire a table lock, blocking until granted. Returns false when
    /// the wait was broken by a deadlock abort; raises on policy
    /// violations (which also abort the transaction).
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbortError> {
        self.gate(txn, mode)?;
        let queue = {
            let mut map = self.table_lock_map.lock();
            map.entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new()))
                .clone()
        };
        self.acquire(queue, txn, mode, oid, None)
    }

    /// Acquire a row lock. Rows only take S or X, and require the matching
    /// table-level lock to be held first.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        if matches!(
            mode,
            LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        ) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.gate(txn, mode)?;

        match mode {
            LockMode::Exclusive => {
                if !txn.holds_table_lock_in(
                    oid,
                    &[
                        LockMode::Exclusive,
                        LockMode::IntentionExclusive,
                        LockMode::SharedIntentionExclusive,
                    ],
                ) {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            LockMode::Shared => {
                if !txn.holds_any_table_lock(oid) {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            _ => {}
        }

        let queue = {
            let mut map = self.row_lock_map.lock();
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new()))
                .clone()
        };
        self.acquire(queue, txn, mode, oid, Some(rid))
    }

    /// Release a table lock, applying the isolation-dependent shrinking
    /// transition. Fails while the transaction still holds row locks on
    /// the table.
    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<bool, TransactionAbortError> {
        let Some(queue) = self.table_lock_map.lock().get(&oid).cloned() else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        self.release(&queue, txn, oid, None)
    }

    /// Release a row lock, applying the shrinking transition
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        let Some(queue) = self.row_lock_map.lock().get(&rid).cloned() else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        self.release(&queue, txn, oid, Some(rid))
    }

    /// Drop everything a finished transaction still holds, rows first.
    /// Used by commit/abort; never transitions the 2PL phase.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for (mode, oid, rid) in txn.row_lock_snapshot() {
            let queue = self.row_lock_map.lock().get(&rid).cloned();
            if let Some(queue) = queue {
                self.remove_request(&queue, txn.id());
            }
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in txn.table_lock_snapshot() {
            let queue = self.table_lock_map.lock().get(&oid).cloned();
            if let Some(queue) = queue {
                self.remove_request(&queue, txn.id());
            }
            txn.remove_table_lock(mode, oid);
        }
    }

    // ------------------------------------------------------------------
    // Acquisition internals
    // ------------------------------------------------------------------

    /// Isolation-level and 2PL-phase gating, applied before touching the
    /// queue
    fn gate(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<(), TransactionAbortError> {
        use LockMode::*;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn acquire(
        &self,
        queue: Arc<LockRequestQueue>,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<Rid>,
    ) -> Result<bool, TransactionAbortError> {
        let mut state = queue.state.lock();

        // A request from this transaction already in the queue makes this
        // an upgrade.
        let mut upgrading = false;
        if let Some(pos) = state.queue.iter().position(|r| r.txn.id() == txn.id()) {
            let held = state.queue[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !held.can_upgrade_to(mode) {
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // Drop the held lock and slot the upgrade in ahead of all
            // plain waiters.
            state.queue.remove(pos);
            match rid {
                Some(rid) => txn.remove_row_lock(held, oid, rid),
                None => txn.remove_table_lock(held, oid),
            }
            let insert_at = state
                .queue
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.queue.len());
            state.queue.insert(
                insert_at,
                LockRequest {
                    txn: txn.clone(),
                    mode,
                    oid,
                    rid,
                    granted: false,
                },
            );
            state.upgrading = Some(txn.id());
            upgrading = true;
        } else {
            state.queue.push(LockRequest {
                txn: txn.clone(),
                mode,
                oid,
                rid,
                granted: false,
            });
        }

        // Block until every granted request is compatible and no older
        // waiter sits ahead. A deadlock abort wakes us with the state
        // already flipped.
        while !Self::can_grant(&state, txn.id(), mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                if upgrading {
                    state.upgrading = None;
                }
                if let Some(pos) = state.queue.iter().position(|r| r.txn.id() == txn.id()) {
                    state.queue.remove(pos);
                }
                queue.cv.notify_all();
                return Ok(false);
            }
        }

        if upgrading {
            state.upgrading = None;
        }
        if let Some(request) = state.queue.iter_mut().find(|r| r.txn.id() == txn.id()) {
            request.granted = true;
        }
        match rid {
            Some(rid) => txn.insert_row_lock(mode, oid, rid),
            None => txn.insert_table_lock(mode, oid),
        }
        trace!(
            "txn {} granted {:?} on table {} row {:?}",
            txn.id(),
            mode,
            oid,
            rid
        );

        // Exclusive grants leave nothing else runnable; everything else
        // may free compatible waiters.
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    /// FIFO-with-coalescing grant rule: all granted requests must be
    /// compatible, and no other waiter may sit ahead of this one.
    fn can_grant(state: &QueueState, txn_id: TxnId, mode: LockMode) -> bool {
        for request in &state.queue {
            if request.granted {
                if !mode.compatible_with(request.mode) {
                    return false;
                }
            } else {
                return request.txn.id() == txn_id;
            }
        }
        false
    }

    fn release(
        &self,
        queue: &Arc<LockRequestQueue>,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Option<Rid>,
    ) -> Result<bool, TransactionAbortError> {
        let removed = {
            let mut state = queue.state.lock();
            match state
                .queue
                .iter()
                .position(|r| r.txn.id() == txn.id() && r.granted)
            {
                Some(pos) => {
                    let request = state.queue.remove(pos);
                    queue.cv.notify_all();
                    Some(request.mode)
                }
                None => None,
            }
        };
        let Some(mode) = removed else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        // 2PL phase transition. Releasing an intention lock never forces
        // shrinking; under READ_UNCOMMITTED only X is reachable here.
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink
            && !matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            )
        {
            txn.set_state(TransactionState::Shrinking);
        }

        match rid {
            Some(rid) => txn.remove_row_lock(mode, oid, rid),
            None => txn.remove_table_lock(mode, oid),
        }
        Ok(true)
    }

    /// Remove any request a finished transaction left in a queue
    fn remove_request(&self, queue: &Arc<LockRequestQueue>, txn_id: TxnId) {
        let mut state = queue.state.lock();
        if state.upgrading == Some(txn_id) {
            state.upgrading = None;
        }
        if let Some(pos) = state.queue.iter().position(|r| r.txn.id() == txn_id) {
            state.queue.remove(pos);
            queue.cv.notify_all();
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbortError {
        txn.set_state(TransactionState::Aborted);
        TransactionAbortError {
            txn_id: txn.id(),
            reason,
        }
    }

    // ------------------------------------------------------------------
    // Deadlock detection
    // ------------------------------------------------------------------

    /// Background loop: sleep an interval, then run one detection pass,
    /// until stopped.
    pub fn run_cycle_detection(self: Arc<Self>) {
        while self.cycle_detection_enabled.load(Ordering::SeqCst) {
            thread::sleep(self.cycle_detection_interval);
            if !self.cycle_detection_enabled.load(Ordering::SeqCst) {
                break;
            }
            self.detect_deadlocks();
        }
    }

    pub fn stop_cycle_detection(&self) {
        self.cycle_detection_enabled.store(false, Ordering::SeqCst);
    }

    /// One detection pass: rebuild the wait-for graph from every queue
    /// (waiters depend on holders), then abort the largest txn id on each
    /// cycle until none remain.
    pub fn detect_deadlocks(&self) {
        let mut graph = WaitForGraph::new();
        let mut waiter_txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        let mut waiter_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();

        // Both maps stay locked for the whole pass so the graph and the
        // evictions act on one consistent snapshot.
        let table_map = self.table_lock_map.lock();
        let row_map = self.row_lock_map.lock();
        for queue in table_map.values().chain(row_map.values()) {
            let state = queue.state.lock();
            let holders: Vec<TxnId> = state
                .queue
                .iter()
                .filter(|r| r.granted)
                .map(|r| r.txn.id())
                .collect();
            for request in state.queue.iter().filter(|r| !r.granted) {
                let waiter = request.txn.id();
                waiter_txns.insert(waiter, request.txn.clone());
                waiter_queues.entry(waiter).or_default().push(queue.clone());
                for &holder in &holders {
                    graph.add_edge(waiter, holder);
                }
            }
        }

        if graph.is_empty() {
            return;
        }
        while let Some(cycle) = graph.find_cycle() {
            let Some(&victim) = cycle.iter().max() else {
                break;
            };
            warn!("deadlock among transactions {cycle:?}; aborting {victim}");
            if let Some(txn) = waiter_txns.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove_transaction(victim);
            if let Some(queues) = waiter_queues.get(&victim) {
                for queue in queues {
                    queue.cv.notify_all();
                }
            }
        }
    }
}
