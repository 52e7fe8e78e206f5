//! Rollback engine: undoes an aborted transaction's writes by walking its
//! undo chain backwards from the most recent record to the first, applying
//! each record's reverse operation to the page it names (spec §4.8).
//!
//! Small aborts unwind inline on the caller's thread; large ones are
//! hashed off in fixed-size windows to [`worker`] so a single huge abort
//! cannot stall whichever transaction triggered it.

pub mod worker;

use crate::error::Result;
use crate::page::{HeapPage, LinePointer, TransactionSlot, TupleHeader};
use crate::pages::PageStore;
use crate::txn::TxnManager;
use crate::types::{SlotIndex, UndoPtr, Xid};
use crate::undo::manager::UndoManager;
use crate::undo::record::{UndoRecord, UndoRecordBody};
use crate::wal::{WalRecord, WalWriter};
use log::{debug, trace, warn};

/// Applies the reverse of one undo record to the page it names. Private:
/// callers go through [`rollback_transaction`] or the windowed worker loop
/// so every application is paired with chain advancement and, eventually,
/// [`TxnManager::mark_undone`].
fn apply_one(pages: &PageStore, record: &UndoRecord) -> Result<()> {
    let lp_idx = record.tid.offset - 1;
    let block = record.tid.block;

    match &record.body {
        UndoRecordBody::TransactionHeader { .. } => {
            // Anchors the chain; nothing on the page to reverse.
        }
        UndoRecordBody::SpeculativeAbort { .. } => {
            // Already unwound synchronously by `dml::speculative_abort`.
        }
        UndoRecordBody::Insert | UndoRecordBody::SpeculativeInsert { .. } => {
            pages.with_page_mut(block, |page| HeapPage::mark_dead(page, lp_idx))?;
        }
        UndoRecordBody::MultiInsert { first_lp, count } => {
            pages.with_page_mut(block, |page| {
                for idx in *first_lp..*first_lp + *count {
                    HeapPage::mark_dead(page, idx)?;
                }
                Ok(())
            })?;
        }
        UndoRecordBody::Delete { old_payload, old_info, old_info2 } => {
            pages.with_page_mut(block, |page| {
                let slot_index = match page.line_pointer(lp_idx)? {
                    LinePointer::Deleted { slot_index } => slot_index,
                    other => {
                        return Err(crate::error::StorageError::Corruption(format!(
                            "rollback of delete expected a Deleted line pointer, found {other:?}"
                        )))
                    }
                };
                let header = TupleHeader {
                    slot_index,
                    info: *old_info,
                    info2: *old_info2,
                    data_offset: TupleHeader::SIZE as u8,
                    payload_len: old_payload.len() as u16,
                };
                HeapPage::undelete_tuple(page, lp_idx, slot_index, old_payload)?;
                HeapPage::rewrite_tuple_header(page, lp_idx, header)
            })?;
        }
        UndoRecordBody::InPlaceUpdate { old_payload, old_info, old_info2 } => {
            pages.with_page_mut(block, |page| {
                let (current, _) = HeapPage::get_tuple(page, lp_idx)?;
                let header = TupleHeader {
                    slot_index: current.slot_index,
                    info: *old_info,
                    info2: *old_info2,
                    data_offset: TupleHeader::SIZE as u8,
                    payload_len: old_payload.len() as u16,
                };
                HeapPage::restore_tuple(page, lp_idx, header, old_payload)
            })?;
        }
        UndoRecordBody::NonInPlaceUpdate { old_payload, old_info, old_info2, .. } => {
            pages.with_page_mut(block, |page| {
                let slot_index = match page.line_pointer(lp_idx)? {
                    LinePointer::Deleted { slot_index } => slot_index,
                    other => {
                        return Err(crate::error::StorageError::Corruption(format!(
                            "rollback of non-in-place update expected a Deleted line pointer, found {other:?}"
                        )))
                    }
                };
                let header = TupleHeader {
                    slot_index,
                    info: *old_info,
                    info2: *old_info2,
                    data_offset: TupleHeader::SIZE as u8,
                    payload_len: old_payload.len() as u16,
                };
                HeapPage::undelete_tuple(page, lp_idx, slot_index, old_payload)?;
                HeapPage::rewrite_tuple_header(page, lp_idx, header)
            })?;
        }
        UndoRecordBody::Lock { old_info2 } => {
            pages.with_page_mut(block, |page| {
                let (mut header, _) = HeapPage::get_tuple(page, lp_idx)?;
                header.info2 = *old_info2;
                HeapPage::rewrite_tuple_header(page, lp_idx, header)
            })?;
        }
        UndoRecordBody::SlotReuse { slot_index, old_xid, old_undo_ptr } => {
            pages.with_page_mut(block, |page| {
                page.set_slot(SlotIndex(*slot_index), TransactionSlot { xid: *old_xid, undo_ptr: *old_undo_ptr })
            })?;
        }
    }
    Ok(())
}

/// Undoes every write `xid` made, walking its per-transaction undo chain
/// from [`TxnManager::last_undo`] back to the chain's head, then marks it
/// [`crate::txn::TxnState::AbortedAndUndone`].
///
/// Applies the whole chain inline. Callers expecting a large abort should
/// use [`worker::UndoWorker`] instead, which breaks the same walk into
/// `config.undo_window_bytes`-sized chunks and yields between them.
pub fn rollback_transaction(
    xid: Xid,
    txn: &TxnManager,
    undo: &UndoManager,
    pages: &PageStore,
    wal: &WalWriter,
) -> Result<()> {
    debug!("rolling back {xid}");
    let mut ptr = txn.last_undo(xid);
    let mut applied = 0usize;
    while !ptr.is_none() {
        let record = undo.fetch(ptr)?;
        trace!("undoing {xid} record at {ptr} tid={}", record.tid);
        apply_one(pages, &record)?;
        applied += 1;
        ptr = record.prev;
    }
    txn.mark_undone(xid);
    wal.append(&WalRecord::ZheapUndoApply { xid, applied_up_to: UndoPtr::NONE })?;
    debug!("rollback of {xid} applied {applied} undo records");
    Ok(())
}

/// Undoes records for `xid` starting at `from` and walking backwards no
/// further than `budget_bytes` worth of undo (estimated as one average
/// record's on-disk frame per step), returning the pointer rollback should
/// resume from next, or `UndoPtr::NONE` once the chain is exhausted.
///
/// Used by [`worker::UndoWorker`] to break a large abort into windows
/// instead of holding page locks for the whole chain in one go (spec
/// §4.8's 32 MiB windowing).
pub fn rollback_window(
    xid: Xid,
    from: UndoPtr,
    budget_bytes: u64,
    undo: &UndoManager,
    pages: &PageStore,
    wal: &WalWriter,
) -> Result<UndoPtr> {
    let mut ptr = from;
    let mut consumed = 0u64;
    while !ptr.is_none() && consumed < budget_bytes {
        let record = undo.fetch(ptr)?;
        let frame_len = record.encode()?.len() as u64;
        apply_one(pages, &record)?;
        consumed += frame_len;
        ptr = record.prev;
    }
    if ptr.is_none() {
        warn!("undo window for {xid} exhausted the chain");
    }
    wal.append(&WalRecord::ZheapUndoApply { xid, applied_up_to: ptr })?;
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dml::{self, DmlContext};
    use crate::page::TransactionStatusLookup;
    use crate::txn::{LockManager, WaitPolicy};
    use crate::wal::WalWriter;

    struct Harness {
        dir: tempfile::TempDir,
        config: EngineConfig,
        txn: TxnManager,
        undo: UndoManager,
        locks: LockManager,
        wal: WalWriter,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let undo = UndoManager::open(dir.path().join("undo")).unwrap();
            let wal = WalWriter::open(dir.path().join("wal.log")).unwrap();
            Self { dir, config: EngineConfig::default(), txn: TxnManager::new(), undo, locks: LockManager::new(), wal }
        }

        fn pages(&self) -> PageStore {
            PageStore::open(self.dir.path().join("table.dat"), self.config).unwrap()
        }
    }

    #[test]
    fn rollback_of_insert_marks_line_pointer_dead() {
        let h = Harness::new();
        let pages = h.pages();
        let block = pages.allocate().unwrap();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();

        let tid = pages
            .with_page_mut(block, |page| {
                let mut ctx = DmlContext { page, block, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                dml::insert(&mut ctx, b"row")
            })
            .unwrap();

        h.txn.abort(xid);
        rollback_transaction(xid, &h.txn, &h.undo, &pages, &h.wal).unwrap();

        let page = pages.read_page(block).unwrap();
        assert_eq!(page.line_pointer(tid.offset - 1).unwrap(), LinePointer::Dead);
        assert!(h.txn.is_aborted_and_undone(xid));
    }

    #[test]
    fn rollback_of_in_place_update_restores_old_image() {
        let h = Harness::new();
        let pages = h.pages();
        let block = pages.allocate().unwrap();
        let writer = h.txn.begin();
        h.undo.attach(writer).unwrap();

        let tid = pages
            .with_page_mut(block, |page| {
                let mut ctx =
                    DmlContext { page, block, xid: writer, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                dml::insert(&mut ctx, b"aaaaa")
            })
            .unwrap();
        h.txn.commit(writer);
        h.undo.detach(writer);

        let updater = h.txn.begin();
        h.undo.attach(updater).unwrap();
        pages
            .with_page_mut(block, |page| {
                let mut ctx =
                    DmlContext { page, block, xid: updater, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                dml::update_in_place(&mut ctx, &h.locks, tid, b"bb", WaitPolicy::Error)
            })
            .unwrap();

        h.txn.abort(updater);
        rollback_transaction(updater, &h.txn, &h.undo, &pages, &h.wal).unwrap();

        let page = pages.read_page(block).unwrap();
        let (_, payload) = HeapPage::get_tuple(&page, tid.offset - 1).unwrap();
        assert_eq!(payload, b"aaaaa");
    }

    #[test]
    fn rollback_of_delete_undeletes_the_row() {
        let h = Harness::new();
        let pages = h.pages();
        let block = pages.allocate().unwrap();
        let writer = h.txn.begin();
        h.undo.attach(writer).unwrap();

        let tid = pages
            .with_page_mut(block, |page| {
                let mut ctx =
                    DmlContext { page, block, xid: writer, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                dml::insert(&mut ctx, b"row")
            })
            .unwrap();
        h.txn.commit(writer);
        h.undo.detach(writer);

        let deleter = h.txn.begin();
        h.undo.attach(deleter).unwrap();
        pages
            .with_page_mut(block, |page| {
                let mut ctx =
                    DmlContext { page, block, xid: deleter, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                dml::delete(&mut ctx, &h.locks, tid, WaitPolicy::Error)
            })
            .unwrap();

        h.txn.abort(deleter);
        rollback_transaction(deleter, &h.txn, &h.undo, &pages, &h.wal).unwrap();

        let page = pages.read_page(block).unwrap();
        let (_, payload) = HeapPage::get_tuple(&page, tid.offset - 1).unwrap();
        assert_eq!(payload, b"row");
    }

    #[test]
    fn rollback_window_stops_within_budget_and_resumes() {
        let h = Harness::new();
        let pages = h.pages();
        let block = pages.allocate().unwrap();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();

        for payload in [b"a" as &[u8], b"b", b"c"] {
            pages
                .with_page_mut(block, |page| {
                    let mut ctx =
                        DmlContext { page, block, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                    dml::insert(&mut ctx, payload)
                })
                .unwrap();
        }

        h.txn.abort(xid);
        let start = h.txn.last_undo(xid);
        // A budget of 1 byte can only ever afford the first record in a
        // window; the walk must stop and report where to resume.
        let resume = rollback_window(xid, start, 1, &h.undo, &pages, &h.wal).unwrap();
        assert!(!resume.is_none());
        let final_ptr = rollback_window(xid, resume, u64::MAX, &h.undo, &pages, &h.wal).unwrap();
        assert!(final_ptr.is_none());

        let page = pages.read_page(block).unwrap();
        assert_eq!(page.line_pointer(0).unwrap(), LinePointer::Dead);
        assert_eq!(page.line_pointer(1).unwrap(), LinePointer::Dead);
        assert_eq!(page.line_pointer(2).unwrap(), LinePointer::Dead);
    }
}
