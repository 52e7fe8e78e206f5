//! Coordinates the set of per-writer undo logs: assigns each active
//! transaction a log to append to, tracks the discard horizon, and serves
//! point and chain reads for the visibility resolver and rollback engine.

use crate::error::{Result, StorageError};
use crate::types::{UndoPtr, Xid};
use crate::undo::log::UndoLog;
use crate::undo::record::UndoRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct Inner {
    logs: HashMap<u32, UndoLog>,
    /// Which log number each currently-attached transaction is writing to.
    attachments: HashMap<Xid, u32>,
    next_log_number: u32,
}

/// Owns every undo log for one table and hands out attachments.
pub struct UndoManager {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl UndoManager {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        Ok(Self { dir, inner: Mutex::new(Inner { logs: HashMap::new(), attachments: HashMap::new(), next_log_number: 0 }) })
    }

    /// Attaches `xid` to a log it can write to: its existing attachment if
    /// it has one, otherwise the first unattached log, otherwise a freshly
    /// created one. Never blocks — undo logs are a scalable resource, not
    /// a contended one.
    pub fn attach(&self, xid: Xid) -> Result<u32> {
        let mut inner = self.inner.lock().expect("undo manager mutex poisoned");
        if let Some(&log_number) = inner.attachments.get(&xid) {
            return Ok(log_number);
        }

        let free = inner
            .logs
            .iter()
            .find(|(_, log)| !log.is_attached())
            .map(|(&n, _)| n);

        let log_number = match free {
            Some(n) => n,
            None => {
                let n = inner.next_log_number;
                inner.next_log_number += 1;
                let log = UndoLog::open(&self.dir, n)?;
                inner.logs.insert(n, log);
                n
            }
        };

        inner.logs.get_mut(&log_number).expect("log just inserted or found").attach(xid)?;
        inner.attachments.insert(xid, log_number);
        Ok(log_number)
    }

    /// Releases `xid`'s log attachment, making the log available to the
    /// next transaction that needs one. Called on commit or abort.
    pub fn detach(&self, xid: Xid) {
        let mut inner = self.inner.lock().expect("undo manager mutex poisoned");
        if let Some(log_number) = inner.attachments.remove(&xid) {
            if let Some(log) = inner.logs.get_mut(&log_number) {
                log.detach();
            }
        }
    }

    /// Appends `record` to `xid`'s attached log. `xid` must already be
    /// attached via [`Self::attach`].
    pub fn append(&self, record: &UndoRecord) -> Result<UndoPtr> {
        let mut inner = self.inner.lock().expect("undo manager mutex poisoned");
        let log_number = *inner
            .attachments
            .get(&record.xid)
            .ok_or_else(|| StorageError::InvalidInput(format!("xid {} is not attached to an undo log", record.xid)))?;
        inner
            .logs
            .get_mut(&log_number)
            .expect("attachment always names a live log")
            .append(record)
    }

    /// Fetches the record at `ptr`.
    pub fn fetch(&self, ptr: UndoPtr) -> Result<UndoRecord> {
        let mut inner = self.inner.lock().expect("undo manager mutex poisoned");
        let log = inner
            .logs
            .get_mut(&ptr.log_number())
            .ok_or_else(|| StorageError::NotFound(format!("no such undo log {}", ptr.log_number())))?;
        log.read_at(ptr.offset())
    }

    /// Fetches the record immediately preceding `ptr` in whichever chain
    /// `prev_of` selects (e.g. `|r| r.prev` for the per-transaction chain,
    /// `|r| r.blkprev` for the per-page chain), or `None` at the chain's
    /// head.
    pub fn fetch_prev(&self, ptr: UndoPtr, prev_of: impl Fn(&UndoRecord) -> UndoPtr) -> Result<Option<UndoRecord>> {
        let record = self.fetch(ptr)?;
        let prev = prev_of(&record);
        if prev.is_none() {
            return Ok(None);
        }
        Ok(Some(self.fetch(prev)?))
    }

    /// Advances the discard horizon for one log. Callers (the discard
    /// worker) are responsible for first proving no active snapshot can
    /// still reach undo below `offset`.
    pub fn discard_log_up_to(&self, log_number: u32, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("undo manager mutex poisoned");
        let log = inner
            .logs
            .get_mut(&log_number)
            .ok_or_else(|| StorageError::NotFound(format!("no such undo log {log_number}")))?;
        log.discard_up_to(offset)
    }

    /// Snapshot of every log's current tail and discard offset, used by
    /// the discard worker to decide how far each log's horizon can move.
    pub fn log_positions(&self) -> Vec<(u32, u64, u64)> {
        let inner = self.inner.lock().expect("undo manager mutex poisoned");
        inner.logs.values().map(|l| (l.log_number(), l.discard_offset(), l.tail())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tid;
    use crate::undo::record::UndoRecordBody;

    fn rec(xid: Xid, prev: UndoPtr) -> UndoRecord {
        UndoRecord { xid, tid: Tid::new(1, 1), prev, blkprev: UndoPtr::NONE, body: UndoRecordBody::Insert }
    }

    #[test]
    fn distinct_transactions_get_distinct_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = UndoManager::open(dir.path()).unwrap();
        let a = mgr.attach(Xid::new(0, 1)).unwrap();
        let b = mgr.attach(Xid::new(0, 2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn detach_frees_log_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = UndoManager::open(dir.path()).unwrap();
        let x1 = Xid::new(0, 1);
        let log_a = mgr.attach(x1).unwrap();
        mgr.detach(x1);
        let x2 = Xid::new(0, 2);
        let log_b = mgr.attach(x2).unwrap();
        assert_eq!(log_a, log_b);
    }

    #[test]
    fn append_and_chain_walk() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = UndoManager::open(dir.path()).unwrap();
        let xid = Xid::new(0, 1);
        mgr.attach(xid).unwrap();
        let p1 = mgr.append(&rec(xid, UndoPtr::NONE)).unwrap();
        let p2 = mgr.append(&rec(xid, p1)).unwrap();
        let prev = mgr.fetch_prev(p2, |r| r.prev).unwrap().unwrap();
        assert_eq!(prev, rec(xid, UndoPtr::NONE));
        assert!(mgr.fetch_prev(p1, |r| r.prev).unwrap().is_none());
    }

    #[test]
    fn append_without_attach_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = UndoManager::open(dir.path()).unwrap();
        let xid = Xid::new(0, 99);
        assert!(mgr.append(&rec(xid, UndoPtr::NONE)).is_err());
    }
}
