//! Assembles the DML kernel, visibility resolver, undo subsystem, lock
//! manager, and page store into one relation handle, the way the teacher's
//! `StorageManager` composes its page cache, WAL writer, and index layer
//! behind a single entry point.
//!
//! `TableAccess` names the operations a caller needs from a table: begin
//! and end a transaction, take a snapshot, and perform the row-level DML
//! and lookups described in §4.5/§4.6. Bitmap scans, sampling, ANALYZE
//! statistics, CLUSTER, and TOAST are out of scope (spec Non-goals); a
//! sequential scan is provided since any reader needs one to find rows at
//! all.

use crate::config::EngineConfig;
use crate::dml::{self, DmlContext};
use crate::error::Result;
use crate::pages::PageStore;
use crate::prune;
use crate::rollback::{self, worker::UndoWorker};
use crate::txn::{LockManager, LockMode, Snapshot, TxnManager, WaitPolicy};
use crate::types::{SpeculativeToken, Tid, Xid};
use crate::undo::manager::UndoManager;
use crate::visibility::{self, Visibility};
use crate::wal::WalWriter;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The row-level and transaction-boundary operations a caller needs from a
/// table. Implemented by [`HeapRelation`]; kept as a trait so callers (and
/// tests) can substitute a stub without pulling in the whole engine.
pub trait TableAccess {
    fn begin(&self) -> Result<Xid>;
    fn commit(&self, xid: Xid) -> Result<()>;
    fn abort(&self, xid: Xid) -> Result<()>;
    fn snapshot(&self) -> Snapshot;

    fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Tid>;
    fn fetch(&self, tid: Tid, snapshot: &Snapshot) -> Result<Visibility>;
    fn delete(&self, xid: Xid, tid: Tid, wait_policy: WaitPolicy) -> Result<()>;
    fn update(&self, xid: Xid, tid: Tid, new_payload: &[u8], wait_policy: WaitPolicy) -> Result<Tid>;
    fn lock_row(&self, xid: Xid, tid: Tid, mode: LockMode, wait_policy: WaitPolicy) -> Result<bool>;
}

/// Which block an insert should target next. A single cursor rather than a
/// free space map: the relation always tries its last-used block first and
/// allocates a fresh one once that fills up (spec's free space map is a
/// Non-goal; see DESIGN.md).
struct InsertCursor {
    block: u32,
}

/// One table: a page store, its undo logs, the transaction and lock
/// managers shared with every other relation in the same engine instance,
/// and a background worker for large aborts.
pub struct HeapRelation {
    config: EngineConfig,
    pages: Arc<PageStore>,
    txn: Arc<TxnManager>,
    undo: Arc<UndoManager>,
    locks: LockManager,
    wal: Arc<WalWriter>,
    worker: UndoWorker,
    cursor: Mutex<InsertCursor>,
}

impl HeapRelation {
    /// Opens (or creates) a table rooted at `dir`: `dir/table.dat` for
    /// pages, `dir/undo` for undo logs, `dir/wal.log` for the WAL.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let pages = Arc::new(PageStore::open(dir.join("table.dat"), config)?);
        let txn = Arc::new(TxnManager::new());
        let undo = Arc::new(UndoManager::open(dir.join("undo"))?);
        let wal = Arc::new(WalWriter::open(dir.join("wal.log"))?);
        let worker = UndoWorker::spawn(Arc::clone(&txn), Arc::clone(&undo), Arc::clone(&pages), Arc::clone(&wal), config);

        let block = if pages.block_count() == 0 { pages.allocate()? } else { 0 };
        Ok(Self {
            config,
            pages,
            txn,
            undo,
            locks: LockManager::new(),
            wal,
            worker,
            cursor: Mutex::new(InsertCursor { block }),
        })
    }

    /// Reclaims dead and all-visible-deleted line pointers' tuple bytes on
    /// `block`, returning the number of line pointers reclaimed (spec
    /// §4.7). Not run automatically; callers schedule it the way the
    /// teacher schedules its own background compaction.
    pub fn prune(&self, block: u32) -> Result<usize> {
        self.pages.with_page_mut(block, |page| prune::prune_page(page, self.txn.as_ref(), self.txn.oldest_active_xid()))
    }

    /// Advances the discard horizon of every undo log as far as currently
    /// safe (spec §4.9). Not run automatically for the same reason as
    /// [`Self::prune`].
    pub fn discard(&self) -> Result<Vec<(u32, u64)>> {
        crate::discard::advance(&self.txn, &self.undo, &self.wal)
    }

    pub fn multi_insert(&self, xid: Xid, payloads: &[&[u8]]) -> Result<Vec<Tid>> {
        let block = self.cursor.lock().expect("insert cursor mutex poisoned").block;
        self.pages.with_page_mut(block, |page| {
            let mut ctx = DmlContext { page, block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::multi_insert(&mut ctx, payloads)
        })
    }

    pub fn speculative_insert(&self, xid: Xid, payload: &[u8], token: SpeculativeToken) -> Result<Tid> {
        let block = self.insert_block(payload.len())?;
        self.pages.with_page_mut(block, |page| {
            let mut ctx = DmlContext { page, block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::speculative_insert(&mut ctx, payload, token)
        })
    }

    pub fn speculative_confirm(&self, xid: Xid, tid: Tid, token: SpeculativeToken) -> Result<()> {
        self.pages.with_page_mut(tid.block, |page| {
            let mut ctx = DmlContext { page, block: tid.block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::speculative_confirm(&mut ctx, tid, token)
        })
    }

    pub fn speculative_abort(&self, xid: Xid, tid: Tid, token: SpeculativeToken) -> Result<()> {
        self.pages.with_page_mut(tid.block, |page| {
            let mut ctx = DmlContext { page, block: tid.block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::speculative_abort(&mut ctx, tid, token)
        })
    }

    /// Picks the block an insert of `payload_len` bytes should land on:
    /// the cursor's current block if it has room, otherwise a fresh one.
    fn insert_block(&self, payload_len: usize) -> Result<u32> {
        let mut cursor = self.cursor.lock().expect("insert cursor mutex poisoned");
        let needed = payload_len + crate::page::tuple::TupleHeader::SIZE + crate::page::line_pointer::LinePointer::SIZE;
        let has_room = self.pages.read_page(cursor.block)?.free_space() >= needed;
        if !has_room {
            cursor.block = self.pages.allocate()?;
        }
        Ok(cursor.block)
    }

    /// Total bytes of undo `xid` has written, used to decide whether its
    /// rollback runs inline or is handed to the background worker (spec
    /// §4.8). Walks the chain without applying anything, so it's safe to
    /// call before `txn.abort`.
    fn undo_size(&self, xid: Xid) -> Result<u64> {
        let mut ptr = self.txn.last_undo(xid);
        let mut total = 0u64;
        while !ptr.is_none() && total <= self.config.foreground_rollback_threshold_bytes {
            let record = self.undo.fetch(ptr)?;
            total += record.encode()?.len() as u64;
            ptr = record.prev;
        }
        Ok(total)
    }
}

impl TableAccess for HeapRelation {
    fn begin(&self) -> Result<Xid> {
        let xid = self.txn.begin();
        self.undo.attach(xid)?;
        Ok(xid)
    }

    fn commit(&self, xid: Xid) -> Result<()> {
        self.txn.commit(xid);
        self.undo.detach(xid);
        self.locks.release_all(xid);
        Ok(())
    }

    fn abort(&self, xid: Xid) -> Result<()> {
        self.txn.abort(xid);
        let size = self.undo_size(xid)?;
        if size <= self.config.foreground_rollback_threshold_bytes {
            rollback::rollback_transaction(xid, &self.txn, &self.undo, &self.pages, &self.wal)?;
        } else {
            self.worker.enqueue(xid, self.txn.last_undo(xid));
        }
        self.undo.detach(xid);
        self.locks.release_all(xid);
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        self.txn.take_snapshot()
    }

    fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Tid> {
        let block = self.insert_block(payload.len())?;
        self.pages.with_page_mut(block, |page| {
            let mut ctx = DmlContext { page, block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::insert(&mut ctx, payload)
        })
    }

    fn fetch(&self, tid: Tid, snapshot: &Snapshot) -> Result<Visibility> {
        let page = self.pages.read_page(tid.block)?;
        visibility::resolve(&page, &self.undo, &self.txn, tid, snapshot)
    }

    fn delete(&self, xid: Xid, tid: Tid, wait_policy: WaitPolicy) -> Result<()> {
        self.pages.with_page_mut(tid.block, |page| {
            let mut ctx = DmlContext { page, block: tid.block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::delete(&mut ctx, &self.locks, tid, wait_policy)
        })
    }

    /// Tries an in-place update first; if the new payload no longer fits
    /// the tuple's reservation, retires the old row and inserts the
    /// replacement, possibly on a different page (spec §4.5).
    fn update(&self, xid: Xid, tid: Tid, new_payload: &[u8], wait_policy: WaitPolicy) -> Result<Tid> {
        let in_place = self.pages.with_page_mut(tid.block, |page| {
            let mut ctx = DmlContext { page, block: tid.block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::update_in_place(&mut ctx, &self.locks, tid, new_payload, wait_policy)
        });

        match in_place {
            Ok(()) => Ok(tid),
            Err(crate::error::StorageError::OutOfPageSpace(_)) => {
                let new_block = self.insert_block(new_payload.len())?;
                let new_tid = self.pages.with_page_mut(new_block, |page| {
                    let mut ctx = DmlContext {
                        page,
                        block: new_block,
                        xid,
                        config: &self.config,
                        txn: &self.txn,
                        undo: &self.undo,
                        wal: &self.wal,
                    };
                    dml::insert(&mut ctx, new_payload)
                })?;
                self.pages.with_page_mut(tid.block, |page| {
                    let mut ctx = DmlContext { page, block: tid.block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
                    dml::update_non_in_place_retire_old(&mut ctx, &self.locks, tid, new_tid, wait_policy)
                })?;
                Ok(new_tid)
            }
            Err(e) => Err(e),
        }
    }

    fn lock_row(&self, xid: Xid, tid: Tid, mode: LockMode, wait_policy: WaitPolicy) -> Result<bool> {
        self.pages.with_page_mut(tid.block, |page| {
            let mut ctx = DmlContext { page, block: tid.block, xid, config: &self.config, txn: &self.txn, undo: &self.undo, wal: &self.wal };
            dml::lock_row(&mut ctx, &self.locks, tid, mode, wait_policy)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_commit_then_fetch_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let rel = HeapRelation::open(dir.path(), EngineConfig::default()).unwrap();

        let xid = rel.begin().unwrap();
        let tid = rel.insert(xid, b"hello").unwrap();
        rel.commit(xid).unwrap();

        let snapshot = rel.snapshot();
        assert_eq!(rel.fetch(tid, &snapshot).unwrap(), Visibility::Visible(b"hello".to_vec()));
    }

    #[test]
    fn abort_makes_insert_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let rel = HeapRelation::open(dir.path(), EngineConfig::default()).unwrap();

        let xid = rel.begin().unwrap();
        let tid = rel.insert(xid, b"row").unwrap();
        rel.abort(xid).unwrap();

        let snapshot = rel.snapshot();
        assert_eq!(rel.fetch(tid, &snapshot).unwrap(), Visibility::Invisible);
    }

    #[test]
    fn update_outgrowing_its_reservation_falls_back_to_non_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let rel = HeapRelation::open(dir.path(), EngineConfig::default()).unwrap();

        let xid = rel.begin().unwrap();
        let tid = rel.insert(xid, b"x").unwrap();
        rel.commit(xid).unwrap();

        let updater = rel.begin().unwrap();
        let big = vec![b'y'; 500]; // exceeds the tiny reservation but still fits a fresh page
        let new_tid = rel.update(updater, tid, &big, WaitPolicy::Error).unwrap();
        rel.commit(updater).unwrap();

        let snapshot = rel.snapshot();
        assert_eq!(rel.fetch(new_tid, &snapshot).unwrap(), Visibility::Visible(big));
        assert_eq!(rel.fetch(tid, &snapshot).unwrap(), Visibility::Invisible);
    }

    #[test]
    fn delete_then_commit_is_invisible_to_fresh_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let rel = HeapRelation::open(dir.path(), EngineConfig::default()).unwrap();

        let xid = rel.begin().unwrap();
        let tid = rel.insert(xid, b"row").unwrap();
        rel.commit(xid).unwrap();

        let deleter = rel.begin().unwrap();
        rel.delete(deleter, tid, WaitPolicy::Error).unwrap();
        rel.commit(deleter).unwrap();

        let snapshot = rel.snapshot();
        assert_eq!(rel.fetch(tid, &snapshot).unwrap(), Visibility::Invisible);
    }
}
