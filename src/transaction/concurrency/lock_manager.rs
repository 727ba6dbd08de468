use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbortError, TransactionState,
};

/// Lock modes a transaction can request on a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One transaction's request on a row. The request keeps a handle to its
/// transaction so a wounding older transaction can abort it in place.
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    wounded: bool,
}

#[derive(Default)]
struct QueueState {
    /// Pending requests in arrival order; only the head can be granted
    wait_queue: VecDeque<LockRequest>,
    /// Requests currently holding the row
    granted_queue: Vec<LockRequest>,
    slock_count: usize,
    xlock: bool,
    /// Transaction currently upgrading shared -> exclusive, if any
    upgrading: Option<TxnId>,
}

impl QueueState {
    fn is_head(&self, txn_id: TxnId) -> bool {
        self.wait_queue
            .front()
            .map_or(false, |request| request.txn.id() == txn_id)
    }

    /// Whether the head of the wait queue is compatible with the
    /// currently granted set
    fn compatible(&self) -> bool {
        if self.granted_queue.is_empty() {
            return true;
        }
        match self.wait_queue.front() {
            Some(head) => match head.mode {
                LockMode::Shared => !self.xlock,
                LockMode::Exclusive => !self.xlock && self.slock_count == 0,
            },
            None => false,
        }
    }
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

/// Row-granular shared/exclusive lock manager.
///
/// Requests queue FIFO per row and block on the queue's condition
/// variable until they reach the head and are compatible with the
/// granted set. Deadlocks are prevented by wound-wait: a waiter aborts
/// every younger transaction in its way, never the other way around.
pub struct LockManager {
    lock_table: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            lock_table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock on `rid`, blocking until granted.
    ///
    /// Returns Ok(false) if the transaction is already aborted, Ok(true)
    /// once granted (or if the lock was already held). Raises a
    /// structured abort on a 2PL violation or when wounded.
    pub fn lock_shared(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        if !self.self_check(txn, LockMode::Shared)? {
            return Ok(false);
        }
        if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }

        let queue = self.request_queue(rid);
        let mut state = queue.state.lock();
        state.wait_queue.push_back(LockRequest {
            txn: txn.clone(),
            mode: LockMode::Shared,
            wounded: false,
        });

        self.wait_for_grant(txn, &queue, &mut state);

        if txn.state() == TransactionState::Aborted {
            Self::remove_waiting(&mut state, txn.id());
            queue.cv.notify_all();
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }

        if let Some(request) = state.wait_queue.pop_front() {
            state.granted_queue.push(request);
        }
        state.slock_count += 1;
        txn.add_shared_lock(rid);
        Ok(true)
    }

    /// Acquire an exclusive lock on `rid`, blocking until granted
    pub fn lock_exclusive(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        if !self.self_check(txn, LockMode::Exclusive)? {
            return Ok(false);
        }
        if txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }

        let queue = self.request_queue(rid);
        let mut state = queue.state.lock();
        state.wait_queue.push_back(LockRequest {
            txn: txn.clone(),
            mode: LockMode::Exclusive,
            wounded: false,
        });

        self.wait_for_grant(txn, &queue, &mut state);

        if txn.state() == TransactionState::Aborted {
            Self::remove_waiting(&mut state, txn.id());
            queue.cv.notify_all();
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }

        if let Some(request) = state.wait_queue.pop_front() {
            state.granted_queue.push(request);
        }
        state.xlock = true;
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Upgrade a held shared lock to an exclusive lock.
    ///
    /// At most one transaction may be upgrading on a row at a time; a
    /// second upgrader is aborted with UpgradeConflict. Returns Ok(false)
    /// when no shared lock is held.
    pub fn lock_upgrade(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        if !self.self_check(txn, LockMode::Shared)? {
            return Ok(false);
        }
        if txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }
        if !txn.is_shared_locked(&rid) {
            return Ok(false);
        }

        let queue = self.request_queue(rid);
        let mut state = queue.state.lock();

        if state.upgrading.is_some() {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::UpgradeConflict,
            });
        }

        // Surrender the shared grant before queueing the exclusive request
        if let Some(pos) = state
            .granted_queue
            .iter()
            .position(|request| request.txn.id() == txn.id())
        {
            let request = state.granted_queue.remove(pos);
            if !request.wounded {
                state.slock_count -= 1;
            }
        }
        txn.remove_shared_lock(&rid);
        state.upgrading = Some(txn.id());

        state.wait_queue.push_back(LockRequest {
            txn: txn.clone(),
            mode: LockMode::Exclusive,
            wounded: false,
        });

        self.wait_for_grant(txn, &queue, &mut state);

        if txn.state() == TransactionState::Aborted {
            state.upgrading = None;
            Self::remove_waiting(&mut state, txn.id());
            queue.cv.notify_all();
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }

        state.upgrading = None;
        if let Some(request) = state.wait_queue.pop_front() {
            state.granted_queue.push(request);
        }
        state.xlock = true;
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Release the caller's lock on `rid`. Returns false if no lock was
    /// held. Transitions GROWING -> SHRINKING, except that READ_COMMITTED
    /// transactions may release shared locks while still growing.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let queue = self.request_queue(rid);
        let is_slock;
        let success;
        {
            let mut state = queue.state.lock();
            is_slock = txn.remove_shared_lock(&rid);
            let is_xlock = txn.remove_exclusive_lock(&rid);
            success = is_slock || is_xlock;

            if success {
                let mut should_notify = false;
                if let Some(pos) = state
                    .granted_queue
                    .iter()
                    .position(|request| request.txn.id() == txn.id())
                {
                    let request = state.granted_queue.remove(pos);
                    // A wounding transaction already gave the grant back
                    if !request.wounded {
                        match request.mode {
                            LockMode::Shared => state.slock_count -= 1,
                            LockMode::Exclusive => state.xlock = false,
                        }
                    }
                    should_notify |= state.slock_count == 0;
                    should_notify |= !state.xlock;
                }
                if should_notify {
                    queue.cv.notify_all();
                }
            }
        }

        if txn.state() == TransactionState::Growing
            && !(is_slock && txn.isolation_level() == IsolationLevel::ReadCommitted)
        {
            txn.set_state(TransactionState::Shrinking);
        }

        success
    }

    /// Validate a lock request against the transaction's 2PL state.
    /// Ok(false) means the transaction is already aborted and the caller
    /// should give up quietly.
    fn self_check(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<bool, TransactionAbortError> {
        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }

        if mode == LockMode::Shared && txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::LockSharedOnReadUncommitted,
            });
        }

        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            });
        }

        Ok(true)
    }

    /// Block until the caller's request is at the head of the queue and
    /// compatible, or the caller has been wounded. The wait predicate
    /// re-checks both on every wakeup; spurious wakeups are harmless.
    fn wait_for_grant(
        &self,
        txn: &Arc<Transaction>,
        queue: &LockRequestQueue,
        state: &mut MutexGuard<'_, QueueState>,
    ) {
        loop {
            if txn.state() == TransactionState::Aborted {
                return;
            }
            if state.is_head(txn.id()) && state.compatible() {
                return;
            }
            if Self::try_wound(state, txn.id()) {
                queue.cv.notify_all();
                if state.is_head(txn.id()) && state.compatible() {
                    return;
                }
            }
            queue.cv.wait(state);
        }
    }

    /// Wound-wait: abort every strictly younger transaction in the queue
    /// so the (older) caller can make progress. Wounding a granted
    /// request returns its share of the grant bookkeeping immediately;
    /// the wounded holder's own unlock consults the flag and does not
    /// double-release. Idempotent per request.
    fn try_wound(state: &mut QueueState, wounder_id: TxnId) -> bool {
        let mut wounded_any = false;

        let QueueState {
            wait_queue,
            granted_queue,
            slock_count,
            xlock,
            ..
        } = &mut *state;

        for request in granted_queue.iter_mut() {
            if !request.wounded && request.txn.id() > wounder_id {
                request.txn.set_state(TransactionState::Aborted);
                match request.mode {
                    LockMode::Shared => *slock_count -= 1,
                    LockMode::Exclusive => *xlock = false,
                }
                request.wounded = true;
                wounded_any = true;
                debug!("txn {} wounded holder txn {}", wounder_id, request.txn.id());
            }
        }

        for request in wait_queue.iter_mut() {
            if !request.wounded && request.txn.id() > wounder_id {
                request.txn.set_state(TransactionState::Aborted);
                request.wounded = true;
                wounded_any = true;
                debug!("txn {} wounded waiter txn {}", wounder_id, request.txn.id());
            }
        }

        wounded_any
    }

    /// Remove a (wounded) transaction's pending request from the queue
    fn remove_waiting(state: &mut QueueState, txn_id: TxnId) {
        state
            .wait_queue
            .retain(|request| request.txn.id() != txn_id);
    }

    /// Lazily create and hand out the queue for a row
    fn request_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut lock_table = self.lock_table.lock();
        lock_table
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }
}
