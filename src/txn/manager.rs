//! Transaction lifecycle: xid assignment, commit/abort bookkeeping, and
//! snapshot construction.
//!
//! Grounded in the teacher's transaction manager: a single mutex-guarded
//! table of transaction states plus an active-set used to build
//! snapshots, with commit/abort driving state transitions rather than a
//! full write-ahead commit protocol (the WAL layer in [`crate::wal`]
//! covers durability separately).

use crate::page::TransactionStatusLookup;
use crate::txn::snapshot::Snapshot;
use crate::types::{UndoPtr, Xid};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Lifecycle state of one transaction as tracked in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    InProgress,
    Committed,
    Aborted,
    /// Aborted, and the rollback engine has finished applying its undo.
    /// Only at this point is the transaction's slot freely reclaimable.
    AbortedAndUndone,
}

struct Inner {
    next_xid: Xid,
    states: HashMap<Xid, TxnState>,
    active: BTreeSet<Xid>,
    /// Most recent undo record each in-progress transaction has written,
    /// so the rollback engine knows where to start unwinding.
    last_undo: HashMap<Xid, UndoPtr>,
}

/// Owns all transaction state for one table.
pub struct TxnManager {
    inner: Mutex<Inner>,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_xid: Xid::new(0, 1),
                states: HashMap::new(),
                active: BTreeSet::new(),
                last_undo: HashMap::new(),
            }),
        }
    }

    /// Assigns a fresh xid and marks it in progress.
    pub fn begin(&self) -> Xid {
        let mut inner = self.inner.lock().expect("txn manager mutex poisoned");
        let xid = inner.next_xid;
        inner.next_xid = xid.next();
        inner.states.insert(xid, TxnState::InProgress);
        inner.active.insert(xid);
        xid
    }

    pub fn commit(&self, xid: Xid) {
        let mut inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.states.insert(xid, TxnState::Committed);
        inner.active.remove(&xid);
    }

    /// Marks a transaction aborted. Its undo has not necessarily run yet;
    /// [`Self::mark_undone`] follows once the rollback engine finishes.
    pub fn abort(&self, xid: Xid) {
        let mut inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.states.insert(xid, TxnState::Aborted);
        inner.active.remove(&xid);
    }

    pub fn mark_undone(&self, xid: Xid) {
        let mut inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.states.insert(xid, TxnState::AbortedAndUndone);
    }

    /// Records `ptr` as the most recent undo record `xid` has written.
    /// Called by the DML kernel after every undo append.
    pub fn record_last_undo(&self, xid: Xid, ptr: UndoPtr) {
        let mut inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.last_undo.insert(xid, ptr);
    }

    /// The undo pointer a rollback of `xid` should start unwinding from.
    #[must_use]
    pub fn last_undo(&self, xid: Xid) -> UndoPtr {
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.last_undo.get(&xid).copied().unwrap_or(UndoPtr::NONE)
    }

    #[must_use]
    pub fn state(&self, xid: Xid) -> Option<TxnState> {
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.states.get(&xid).copied()
    }

    /// Builds a snapshot reflecting the currently active set. The
    /// snapshot's `xmin` is the oldest still-active xid, or the next xid
    /// to be assigned if nothing is active.
    #[must_use]
    pub fn take_snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        let xmin = inner.active.iter().next().copied().unwrap_or(inner.next_xid);
        Snapshot { xmin, xmax: inner.next_xid, active: inner.active.iter().copied().collect() }
    }

    /// The oldest xid any present or future snapshot might still need to
    /// see, used by the discard horizon (spec §4.9).
    #[must_use]
    pub fn oldest_active_xid(&self) -> Xid {
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        inner.active.iter().next().copied().unwrap_or(inner.next_xid)
    }
}

impl TransactionStatusLookup for TxnManager {
    fn is_committed_all_visible(&self, xid: Xid) -> bool {
        if !xid.is_valid() {
            return true; // the frozen sentinel is always all-visible
        }
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        matches!(inner.states.get(&xid), Some(TxnState::Committed))
            && xid < inner.active.iter().next().copied().unwrap_or(inner.next_xid)
    }

    fn is_committed_not_all_visible(&self, xid: Xid) -> bool {
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        match inner.states.get(&xid) {
            Some(TxnState::Committed) => xid >= inner.active.iter().next().copied().unwrap_or(inner.next_xid),
            _ => false,
        }
    }

    fn is_aborted_and_undone(&self, xid: Xid) -> bool {
        if !xid.is_valid() {
            return false;
        }
        let inner = self.inner.lock().expect("txn manager mutex poisoned");
        matches!(inner.states.get(&xid), Some(TxnState::AbortedAndUndone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_assigns_increasing_xids() {
        let mgr = TxnManager::new();
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b > a);
    }

    #[test]
    fn commit_then_no_active_makes_it_all_visible() {
        let mgr = TxnManager::new();
        let a = mgr.begin();
        mgr.commit(a);
        assert!(mgr.is_committed_all_visible(a));
    }

    #[test]
    fn commit_with_older_active_xid_is_not_all_visible() {
        let mgr = TxnManager::new();
        let older = mgr.begin();
        let newer = mgr.begin();
        mgr.commit(newer);
        assert!(mgr.is_committed_not_all_visible(newer));
        let _ = older;
    }

    #[test]
    fn snapshot_excludes_still_active_writers() {
        let mgr = TxnManager::new();
        let a = mgr.begin();
        let snap = mgr.take_snapshot();
        assert!(!snap.can_see_committed(a));
        mgr.commit(a);
        let snap2 = mgr.take_snapshot();
        assert!(snap2.can_see_committed(a));
    }

    #[test]
    fn abort_then_undone_frees_for_reuse() {
        let mgr = TxnManager::new();
        let a = mgr.begin();
        mgr.abort(a);
        assert!(!mgr.is_aborted_and_undone(a));
        mgr.mark_undone(a);
        assert!(mgr.is_aborted_and_undone(a));
    }
}
