use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Transaction manager - creates transactions and drives them to their
/// terminal state, releasing row locks on the way out.
///
/// The lock manager only ever moves a transaction to ABORTED; the
/// GROWING -> SHRINKING transition happens inside unlock and the
/// terminal transitions happen here.
pub struct TransactionManager {
    /// Next transaction ID to assign; ids double as age for wound-wait
    next_txn_id: AtomicU32,

    /// Lock manager shared with the executors
    lock_manager: Arc<LockManager>,

    /// Active transactions map (txn_id -> Transaction)
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

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));

        self.active_transactions
            .lock()
            .insert(txn_id, txn.clone());

        txn
    }

    /// Commit a transaction, releasing every lock it still holds
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.release_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.active_transactions.lock().remove(&txn.id());
    }

    /// Abort a transaction, releasing every lock it still holds
    pub fn abort(&self, txn: &Arc<Transaction>) {
        self.release_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.active_transactions.lock().remove(&txn.id());
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    fn release_locks(&self, txn: &Arc<Transaction>) {
        for rid in txn.shared_locks() {
            self.lock_manager.unlock(txn, rid);
        }
        for rid in txn.exclusive_locks() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
