use std::collections::HashSet;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states under strict two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    Deadlock,
}

/// Structured abort raised by the lock manager. The transaction has
/// already been moved to the ABORTED state when this is returned; the
/// owner is responsible for terminal teardown.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Transaction {txn_id} aborted: {reason:?}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// An active transaction as the lock manager observes it: an id that
/// doubles as its age (smaller is older), a 2PL state, and the sets of
/// row locks currently held.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_shared_locked(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn is_exclusive_locked(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    /// Returns whether the lock was held
    pub fn remove_shared_lock(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().remove(rid)
    }

    /// Returns whether the lock was held
    pub fn remove_exclusive_lock(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().remove(rid)
    }

    /// Snapshot of the shared locks currently held
    pub fn shared_locks(&self) -> Vec<Rid> {
        self.shared_lock_set.lock().iter().copied().collect()
    }

    /// Snapshot of the exclusive locks currently held
    pub fn exclusive_locks(&self) -> Vec<Rid> {
        self.exclusive_lock_set.lock().iter().copied().collect()
    }
}
