//! Row-level lock table.
//!
//! Grounded in the teacher's resource-keyed lock manager: one entry per
//! contended resource (here, a `Tid`) holding the set of transactions
//! that currently hold it and in what mode, released en masse when a
//! transaction ends.

use crate::error::{Result, StorageError};
use crate::types::{Tid, Xid};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Strength-ordered row lock modes (spec §5). Holding a stronger mode
/// implies every guarantee of a weaker one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Share,
    ForNoKeyUpdate,
    ForUpdate,
}

impl LockMode {
    fn is_exclusive(self) -> bool {
        matches!(self, Self::ForNoKeyUpdate | Self::ForUpdate)
    }

    fn conflicts_with(self, other: Self) -> bool {
        self.is_exclusive() || other.is_exclusive()
    }
}

/// What to do when a row lock is already held by another transaction in a
/// conflicting mode (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wait for the conflicting holder(s) to release.
    Block,
    /// Return immediately, letting the caller skip this row.
    Skip,
    /// Return immediately with an error.
    Error,
}

struct RowLock {
    holders: HashMap<Xid, LockMode>,
}

impl RowLock {
    fn strongest_conflicting(&self, requester: Xid, mode: LockMode) -> Option<Xid> {
        self.holders
            .iter()
            .find(|&(&xid, &held)| xid != requester && held.conflicts_with(mode))
            .map(|(&xid, _)| xid)
    }
}

struct Inner {
    rows: HashMap<Tid, RowLock>,
    /// Every lock currently held by each transaction, so it can release
    /// them all on commit or abort without scanning the whole table.
    by_xid: HashMap<Xid, Vec<Tid>>,
}

/// Owns the row lock table for one relation.
pub struct LockManager {
    inner: Mutex<Inner>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { rows: HashMap::new(), by_xid: HashMap::new() }), released: Condvar::new() }
    }

    /// Attempts to acquire `mode` on `tid` for `xid`, following
    /// `wait_policy` when a conflicting holder is found. Strongest-lock-
    /// prevails: if `xid` already holds a stronger mode, this is a no-op.
    pub fn acquire(&self, tid: Tid, xid: Xid, mode: LockMode, wait_policy: WaitPolicy) -> Result<bool> {
        let mut inner = self.inner.lock().expect("lock manager mutex poisoned");
        loop {
            let row = inner.rows.entry(tid).or_insert_with(|| RowLock { holders: HashMap::new() });
            if let Some(&held) = row.holders.get(&xid) {
                if held >= mode {
                    return Ok(true);
                }
            }
            match row.strongest_conflicting(xid, mode) {
                None => {
                    row.holders.insert(xid, mode);
                    inner.by_xid.entry(xid).or_default().push(tid);
                    return Ok(true);
                }
                Some(conflicting_xid) => match wait_policy {
                    WaitPolicy::Skip => return Ok(false),
                    WaitPolicy::Error => {
                        return Err(StorageError::LockNotAvailable(format!(
                            "tuple {tid} is locked by transaction {conflicting_xid}"
                        )))
                    }
                    WaitPolicy::Block => {
                        let (guard, timed_out) = self
                            .released
                            .wait_timeout(inner, Duration::from_millis(50))
                            .expect("lock manager condvar poisoned");
                        inner = guard;
                        if timed_out.timed_out() {
                            // Re-check the table on the next loop iteration
                            // rather than waiting forever on a holder that
                            // may have released without a stored wakeup.
                            continue;
                        }
                    }
                },
            }
        }
    }

    /// Releases every lock `xid` holds. Called on transaction end.
    pub fn release_all(&self, xid: Xid) {
        let mut inner = self.inner.lock().expect("lock manager mutex poisoned");
        if let Some(tids) = inner.by_xid.remove(&xid) {
            for tid in tids {
                if let Some(row) = inner.rows.get_mut(&tid) {
                    row.holders.remove(&xid);
                    if row.holders.is_empty() {
                        inner.rows.remove(&tid);
                    }
                }
            }
        }
        drop(inner);
        self.released.notify_all();
    }

    #[must_use]
    pub fn holders(&self, tid: Tid) -> Vec<(Xid, LockMode)> {
        let inner = self.inner.lock().expect("lock manager mutex poisoned");
        inner.rows.get(&tid).map(|r| r.holders.iter().map(|(&x, &m)| (x, m)).collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_locks_are_compatible() {
        let lm = LockManager::new();
        let tid = Tid::new(1, 1);
        assert!(lm.acquire(tid, Xid::new(0, 1), LockMode::Share, WaitPolicy::Error).unwrap());
        assert!(lm.acquire(tid, Xid::new(0, 2), LockMode::Share, WaitPolicy::Error).unwrap());
    }

    #[test]
    fn exclusive_conflicts_with_share() {
        let lm = LockManager::new();
        let tid = Tid::new(1, 1);
        lm.acquire(tid, Xid::new(0, 1), LockMode::Share, WaitPolicy::Error).unwrap();
        let result = lm.acquire(tid, Xid::new(0, 2), LockMode::ForUpdate, WaitPolicy::Error);
        assert!(matches!(result, Err(StorageError::LockNotAvailable(_))));
    }

    #[test]
    fn skip_policy_returns_false_instead_of_erroring() {
        let lm = LockManager::new();
        let tid = Tid::new(1, 1);
        lm.acquire(tid, Xid::new(0, 1), LockMode::ForUpdate, WaitPolicy::Error).unwrap();
        let granted = lm.acquire(tid, Xid::new(0, 2), LockMode::Share, WaitPolicy::Skip).unwrap();
        assert!(!granted);
    }

    #[test]
    fn same_transaction_upgrade_is_a_no_op() {
        let lm = LockManager::new();
        let tid = Tid::new(1, 1);
        let xid = Xid::new(0, 1);
        lm.acquire(tid, xid, LockMode::Share, WaitPolicy::Error).unwrap();
        assert!(lm.acquire(tid, xid, LockMode::ForUpdate, WaitPolicy::Error).unwrap());
        assert_eq!(lm.holders(tid), vec![(xid, LockMode::ForUpdate)]);
    }

    #[test]
    fn release_all_clears_row_entirely() {
        let lm = LockManager::new();
        let tid = Tid::new(1, 1);
        let xid = Xid::new(0, 1);
        lm.acquire(tid, xid, LockMode::ForUpdate, WaitPolicy::Error).unwrap();
        lm.release_all(xid);
        assert!(lm.holders(tid).is_empty());
    }

    #[test]
    fn blocked_waiter_is_granted_after_release() {
        let lm = std::sync::Arc::new(LockManager::new());
        let tid = Tid::new(1, 1);
        let holder = Xid::new(0, 1);
        lm.acquire(tid, holder, LockMode::ForUpdate, WaitPolicy::Error).unwrap();

        let lm2 = lm.clone();
        let handle = std::thread::spawn(move || {
            lm2.acquire(tid, Xid::new(0, 2), LockMode::Share, WaitPolicy::Block).unwrap()
        });
        std::thread::sleep(Duration::from_millis(20));
        lm.release_all(holder);
        assert!(handle.join().unwrap());
    }
}
