//! The DML kernel: every mutating operation follows the same ordered
//! protocol (spec §4.5):
//!
//! 1. identify the line pointer
//! 2. acquire or confirm the owning transaction slot
//! 3. prepare the undo record that would reverse this operation
//! 4. append it to the writer's undo log
//! 5. mutate the page
//! 6. point the slot at the new undo record
//! 7. emit the WAL record
//!
//! Undo is always appended before the page is touched, so a crash between
//! steps 4 and 5 leaves an orphaned-but-harmless undo record rather than a
//! page mutation with nothing to reverse it.

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::page::{HeapPage, LinePointer, Page, SlotAcquisition, TransactionSlot, TupleHeader};
use crate::page::slot::find_or_allocate;
use crate::txn::{LockManager, LockMode, TxnManager, WaitPolicy};
use crate::types::{SlotIndex, SpeculativeToken, Tid, UndoPtr, Xid};
use crate::undo::manager::UndoManager;
use crate::undo::record::{UndoRecord, UndoRecordBody};
use crate::wal::{WalRecord, WalWriter};

/// The page, its block number, and the shared services one DML call needs.
/// Built fresh by `HeapRelation` for each call rather than stored, since
/// the page being mutated changes from call to call.
pub struct DmlContext<'a> {
    pub page: &'a mut Page,
    pub block: u32,
    pub xid: Xid,
    pub config: &'a EngineConfig,
    pub txn: &'a TxnManager,
    pub undo: &'a UndoManager,
    pub wal: &'a WalWriter,
}

/// Resolves which slot on `page` should own `xid`'s next write, emitting a
/// slot-reuse undo record first if the only available slot is occupied by
/// a committed-but-not-all-visible transaction.
fn acquire_slot(ctx: &mut DmlContext<'_>) -> Result<SlotIndex> {
    loop {
        let slots = ctx.page.slots()?;
        match find_or_allocate(&slots, ctx.xid, ctx.txn)? {
            SlotAcquisition::Reused(idx) | SlotAcquisition::Allocated(idx) => {
                let mut slot = ctx.page.slot(idx)?;
                if slot.xid != ctx.xid {
                    slot = TransactionSlot { xid: ctx.xid, undo_ptr: UndoPtr::NONE };
                    ctx.page.set_slot(idx, slot)?;
                }
                return Ok(idx);
            }
            SlotAcquisition::NeedsSlotReuseUndo { victim, victim_xid } => {
                let victim_slot = ctx.page.slot(victim)?;
                let reuse_record = UndoRecord {
                    xid: ctx.xid,
                    tid: Tid::new(ctx.block, 1),
                    prev: ctx.txn.last_undo(ctx.xid),
                    blkprev: victim_slot.undo_ptr,
                    body: UndoRecordBody::SlotReuse {
                        slot_index: victim.0,
                        old_xid: victim_xid,
                        old_undo_ptr: victim_slot.undo_ptr,
                    },
                };
                let reuse_ptr = ctx.undo.append(&reuse_record)?;
                ctx.txn.record_last_undo(ctx.xid, reuse_ptr);
                ctx.page.set_slot(victim, TransactionSlot { xid: ctx.xid, undo_ptr: reuse_ptr })?;
                // Loop again: the slot is now this transaction's own.
            }
        }
    }
}

/// Inserts a new tuple, returning the `Tid` assigned to it.
pub fn insert(ctx: &mut DmlContext<'_>, payload: &[u8]) -> Result<Tid> {
    let lp_idx = HeapPage::peek_insert_line_pointer(ctx.page, payload.len())?;
    let tid = Tid::new(ctx.block, lp_idx + 1);

    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);

    let undo_record = UndoRecord { xid: ctx.xid, tid, prev, blkprev, body: UndoRecordBody::Insert };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    let actual_lp_idx = HeapPage::insert_tuple(ctx.page, slot_index, payload)?;
    debug_assert_eq!(actual_lp_idx, lp_idx, "line pointer allocation diverged between peek and insert");

    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapInsert { tid, xid: ctx.xid, slot_index, payload: payload.to_vec() })?;
    Ok(tid)
}

fn line_pointer_index(tid: Tid) -> u16 {
    tid.offset - 1
}

/// Deletes the tuple at `tid`, taking an exclusive row lock first.
pub fn delete(ctx: &mut DmlContext<'_>, locks: &LockManager, tid: Tid, wait_policy: WaitPolicy) -> Result<()> {
    if !locks.acquire(tid, ctx.xid, LockMode::ForUpdate, wait_policy)? {
        return Err(StorageError::LockNotAvailable(format!("could not lock {tid} for delete")));
    }

    let lp_idx = line_pointer_index(tid);
    let (old_header, old_payload) = HeapPage::get_tuple(ctx.page, lp_idx)?;
    let old_payload = old_payload.to_vec();

    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);
    let undo_record = UndoRecord {
        xid: ctx.xid,
        tid,
        prev,
        blkprev,
        body: UndoRecordBody::Delete { old_payload, old_info: old_header.info, old_info2: old_header.info2 },
    };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    HeapPage::mark_deleted(ctx.page, lp_idx, slot_index)?;
    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapDelete { tid, xid: ctx.xid, slot_index })?;
    Ok(())
}

/// Updates the tuple at `tid` in place. Fails with `OutOfPageSpace`
/// (caller should fall back to [`update_non_in_place`]) if the new
/// payload no longer fits in the tuple's existing reservation.
pub fn update_in_place(
    ctx: &mut DmlContext<'_>,
    locks: &LockManager,
    tid: Tid,
    new_payload: &[u8],
    wait_policy: WaitPolicy,
) -> Result<()> {
    if !locks.acquire(tid, ctx.xid, LockMode::ForNoKeyUpdate, wait_policy)? {
        return Err(StorageError::LockNotAvailable(format!("could not lock {tid} for update")));
    }

    let lp_idx = line_pointer_index(tid);
    let (old_header, old_payload) = HeapPage::get_tuple(ctx.page, lp_idx)?;
    let old_payload = old_payload.to_vec();

    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);
    let undo_record = UndoRecord {
        xid: ctx.xid,
        tid,
        prev,
        blkprev,
        body: UndoRecordBody::InPlaceUpdate {
            old_payload,
            old_info: old_header.info,
            old_info2: old_header.info2,
        },
    };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    let mut new_header = old_header;
    new_header.slot_index = slot_index;
    new_header.info2 |= crate::page::tuple::INFO2_IN_PLACE_UPDATED;
    HeapPage::update_in_place(ctx.page, lp_idx, new_header, new_payload)?;
    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapUpdate {
        old_tid: tid,
        new_tid: tid,
        xid: ctx.xid,
        slot_index,
        in_place: true,
        payload: new_payload.to_vec(),
    })?;
    Ok(())
}

/// Retires the old row's line pointer as part of a non-in-place update
/// whose replacement tuple lives elsewhere (possibly on another page);
/// `new_tid` is recorded in the undo record so the forward chain can be
/// traced, but the caller (`HeapRelation::update`) is responsible for
/// performing the matching insert.
pub fn update_non_in_place_retire_old(
    ctx: &mut DmlContext<'_>,
    locks: &LockManager,
    old_tid: Tid,
    new_tid: Tid,
    wait_policy: WaitPolicy,
) -> Result<()> {
    if !locks.acquire(old_tid, ctx.xid, LockMode::ForNoKeyUpdate, wait_policy)? {
        return Err(StorageError::LockNotAvailable(format!("could not lock {old_tid} for update")));
    }

    let lp_idx = line_pointer_index(old_tid);
    let (old_header, old_payload) = HeapPage::get_tuple(ctx.page, lp_idx)?;
    let old_payload = old_payload.to_vec();

    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);
    let undo_record = UndoRecord {
        xid: ctx.xid,
        tid: old_tid,
        prev,
        blkprev,
        body: UndoRecordBody::NonInPlaceUpdate {
            old_payload,
            old_info: old_header.info,
            old_info2: old_header.info2,
            new_tid,
        },
    };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    HeapPage::mark_deleted(ctx.page, lp_idx, slot_index)?;
    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapUpdate {
        old_tid,
        new_tid,
        xid: ctx.xid,
        slot_index,
        in_place: false,
        payload: Vec::new(),
    })?;
    Ok(())
}

/// Inserts `payloads` as a batch sharing a single undo record and a single
/// WAL record, used for bulk-load style inserts (spec §4.5).
pub fn multi_insert(ctx: &mut DmlContext<'_>, payloads: &[&[u8]]) -> Result<Vec<Tid>> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }
    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);

    let first_lp = ctx.page.line_pointer_count();
    let mut tids = Vec::with_capacity(payloads.len());
    for &payload in payloads {
        let lp_idx = HeapPage::insert_tuple(ctx.page, slot_index, payload)?;
        tids.push(Tid::new(ctx.block, lp_idx + 1));
    }

    let undo_record = UndoRecord {
        xid: ctx.xid,
        tid: Tid::new(ctx.block, first_lp + 1),
        prev,
        blkprev,
        body: UndoRecordBody::MultiInsert { first_lp, count: payloads.len() as u16 },
    };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);
    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapMultiInsert {
        block: ctx.block,
        first_lp,
        count: payloads.len() as u16,
        xid: ctx.xid,
    })?;
    Ok(tids)
}

/// Acquires a row lock and records it so a crash or a later reader can
/// reconstruct that the lock was held.
pub fn lock_row(
    ctx: &mut DmlContext<'_>,
    locks: &LockManager,
    tid: Tid,
    mode: LockMode,
    wait_policy: WaitPolicy,
) -> Result<bool> {
    if !locks.acquire(tid, ctx.xid, mode, wait_policy)? {
        return Ok(false);
    }

    let lp_idx = line_pointer_index(tid);
    let (old_header, _) = HeapPage::get_tuple(ctx.page, lp_idx)?;

    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);
    let undo_record = UndoRecord {
        xid: ctx.xid,
        tid,
        prev,
        blkprev,
        body: UndoRecordBody::Lock { old_info2: old_header.info2 },
    };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    let mut new_header = old_header;
    new_header.info2 |= crate::page::tuple::INFO2_HAS_LOCK;
    HeapPage::rewrite_tuple_header(ctx.page, lp_idx, new_header)?;
    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    let mode_tag = match mode {
        LockMode::Share => 0u8,
        LockMode::ForNoKeyUpdate => 1u8,
        LockMode::ForUpdate => 2u8,
    };
    ctx.wal.append(&WalRecord::ZheapLock { tid, xid: ctx.xid, mode_tag })?;
    Ok(true)
}

/// Inserts a tuple marked speculative, returning its `Tid` and a token the
/// caller must later pass to [`speculative_confirm`] or
/// [`speculative_abort`]. The token travels with the undo record itself
/// (`UndoRecordBody::SpeculativeInsert`) rather than only the WAL, so a
/// transaction-level rollback that overtakes an unresolved speculative
/// insert can still be correlated back to it.
pub fn speculative_insert(ctx: &mut DmlContext<'_>, payload: &[u8], token: SpeculativeToken) -> Result<Tid> {
    let lp_idx = HeapPage::peek_insert_line_pointer(ctx.page, payload.len())?;
    let tid = Tid::new(ctx.block, lp_idx + 1);

    let slot_index = acquire_slot(ctx)?;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);

    let undo_record = UndoRecord { xid: ctx.xid, tid, prev, blkprev, body: UndoRecordBody::SpeculativeInsert { token } };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    let actual_lp_idx = HeapPage::insert_tuple(ctx.page, slot_index, payload)?;
    debug_assert_eq!(actual_lp_idx, lp_idx, "line pointer allocation diverged between peek and insert");

    let (mut header, _) = HeapPage::get_tuple(ctx.page, actual_lp_idx)?;
    header.info2 |= crate::page::tuple::INFO2_SPECULATIVE;
    HeapPage::rewrite_tuple_header(ctx.page, actual_lp_idx, header)?;

    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapInsert { tid, xid: ctx.xid, slot_index, payload: payload.to_vec() })?;
    Ok(tid)
}

/// Clears the speculative flag, making the insert a normal durable row.
pub fn speculative_confirm(ctx: &mut DmlContext<'_>, tid: Tid, token: SpeculativeToken) -> Result<()> {
    let lp_idx = line_pointer_index(tid);
    let (mut header, _) = HeapPage::get_tuple(ctx.page, lp_idx)?;
    header.info2 &= !crate::page::tuple::INFO2_SPECULATIVE;
    HeapPage::rewrite_tuple_header(ctx.page, lp_idx, header)?;
    ctx.wal.append(&WalRecord::ZheapSpecConfirm { tid, token })?;
    Ok(())
}

/// Unwinds a failed speculative insert immediately, without waiting for
/// the owning transaction to abort: the line pointer goes straight back to
/// `Unused`, since no other transaction could have taken a dependent lock
/// on a speculative row that was never confirmed, and there is no visible
/// prior image pruning would need to preserve.
pub fn speculative_abort(ctx: &mut DmlContext<'_>, tid: Tid, token: SpeculativeToken) -> Result<()> {
    let lp_idx = line_pointer_index(tid);
    let (old_header, _) = HeapPage::get_tuple(ctx.page, lp_idx)?;

    let slot_index = old_header.slot_index;
    let blkprev = ctx.page.slot(slot_index)?.undo_ptr;
    let prev = ctx.txn.last_undo(ctx.xid);
    let undo_record = UndoRecord { xid: ctx.xid, tid, prev, blkprev, body: UndoRecordBody::SpeculativeAbort { token } };
    let undo_ptr = ctx.undo.append(&undo_record)?;
    ctx.txn.record_last_undo(ctx.xid, undo_ptr);

    HeapPage::mark_unused(ctx.page, lp_idx)?;
    ctx.page.set_slot(slot_index, TransactionSlot { xid: ctx.xid, undo_ptr })?;

    ctx.wal.append(&WalRecord::ZheapSpecAbort { tid, token })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
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
            Self { _dir: dir, config: EngineConfig::default(), txn: TxnManager::new(), undo, locks: LockManager::new(), wal }
        }
    }

    #[test]
    fn insert_then_delete_round_trips_through_undo() {
        let h = Harness::new();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);

        let tid = {
            let mut ctx =
                DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            insert(&mut ctx, b"hello").unwrap()
        };
        {
            let (_, payload) = HeapPage::get_tuple(&page, line_pointer_index(tid)).unwrap();
            assert_eq!(payload, b"hello");
        }

        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        delete(&mut ctx, &h.locks, tid, WaitPolicy::Error).unwrap();
        assert!(matches!(page.line_pointer(line_pointer_index(tid)).unwrap(), LinePointer::Deleted { .. }));
    }

    #[test]
    fn update_in_place_rewrites_payload() {
        let h = Harness::new();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);

        let tid = {
            let mut ctx =
                DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            insert(&mut ctx, b"aaaaa").unwrap()
        };
        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        update_in_place(&mut ctx, &h.locks, tid, b"bb", WaitPolicy::Error).unwrap();
        let (header, payload) = HeapPage::get_tuple(&page, line_pointer_index(tid)).unwrap();
        assert_eq!(payload, b"bb");
        assert!(header.in_place_updated());
    }

    #[test]
    fn multi_insert_shares_one_undo_record() {
        let h = Harness::new();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);
        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        let tids = multi_insert(&mut ctx, &[b"a", b"b", b"c"]).unwrap();
        assert_eq!(tids.len(), 3);
    }

    #[test]
    fn speculative_insert_sets_flag_and_keeps_token_in_undo() {
        let h = Harness::new();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);
        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        let tid = speculative_insert(&mut ctx, b"maybe", 42).unwrap();

        let (header, payload) = HeapPage::get_tuple(&page, line_pointer_index(tid)).unwrap();
        assert_eq!(payload, b"maybe");
        assert_ne!(header.info2 & crate::page::tuple::INFO2_SPECULATIVE, 0);

        let undo_ptr = h.txn.last_undo(xid);
        let record = h.undo.fetch(undo_ptr).unwrap();
        assert_eq!(record.body, UndoRecordBody::SpeculativeInsert { token: 42 });
    }

    #[test]
    fn speculative_confirm_clears_the_flag() {
        let h = Harness::new();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);
        let tid = {
            let mut ctx =
                DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            speculative_insert(&mut ctx, b"row", 7).unwrap()
        };
        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        speculative_confirm(&mut ctx, tid, 7).unwrap();

        let (header, _) = HeapPage::get_tuple(&page, line_pointer_index(tid)).unwrap();
        assert_eq!(header.info2 & crate::page::tuple::INFO2_SPECULATIVE, 0);
    }

    #[test]
    fn speculative_abort_frees_the_line_pointer_and_records_undo() {
        let h = Harness::new();
        let xid = h.txn.begin();
        h.undo.attach(xid).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);
        let tid = {
            let mut ctx =
                DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            speculative_insert(&mut ctx, b"row", 9).unwrap()
        };
        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        speculative_abort(&mut ctx, tid, 9).unwrap();

        assert_eq!(page.line_pointer(line_pointer_index(tid)).unwrap(), LinePointer::Unused);

        let undo_ptr = h.txn.last_undo(xid);
        let record = h.undo.fetch(undo_ptr).unwrap();
        assert_eq!(record.body, UndoRecordBody::SpeculativeAbort { token: 9 });

        // A subsequent insert on the same page may reuse the freed slot.
        let next_tid = insert(&mut ctx, b"fresh").unwrap();
        assert_eq!(line_pointer_index(next_tid), line_pointer_index(tid));
    }

    #[test]
    fn delete_without_lock_conflict_from_other_txn_errors() {
        let h = Arc::new(Harness::new());
        let writer = h.txn.begin();
        h.undo.attach(writer).unwrap();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);
        let tid = {
            let mut ctx = DmlContext {
                page: &mut page,
                block: 0,
                xid: writer,
                config: &h.config,
                txn: &h.txn,
                undo: &h.undo,
                wal: &h.wal,
            };
            insert(&mut ctx, b"row").unwrap()
        };

        let other = h.txn.begin();
        h.undo.attach(other).unwrap();
        h.locks.acquire(tid, writer, LockMode::ForUpdate, WaitPolicy::Error).unwrap();
        let mut ctx =
            DmlContext { page: &mut page, block: 0, xid: other, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
        let result = delete(&mut ctx, &h.locks, tid, WaitPolicy::Error);
        assert!(matches!(result, Err(StorageError::LockNotAvailable(_))));
    }
}
