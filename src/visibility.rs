//! Visibility resolution: given a row and a snapshot, decide which
//! version (if any) that snapshot should see (spec §4.6).
//!
//! The page always holds the *latest* tuple image. Older images live only
//! in undo. A reader whose snapshot cannot see the current writer walks
//! the page's undo chain backwards, unwinding one operation at a time,
//! until it finds a version written by a transaction its snapshot can see
//! or runs off the head of the chain.

use crate::error::Result;
use crate::page::{HeapPage, LinePointer, Page};
use crate::txn::{Snapshot, TxnManager, TxnState};
use crate::types::{Tid, UndoPtr, Xid};
use crate::undo::manager::UndoManager;
use crate::undo::record::UndoRecordBody;

/// Whether, and with what payload, a row is visible to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// The row exists and this is its visible payload.
    Visible(Vec<u8>),
    /// The row does not exist for this snapshot, either because it was
    /// never inserted yet or because its insertion has since been undone.
    Invisible,
}

fn committed_visible(txn: &TxnManager, snapshot: &Snapshot, xid: Xid) -> bool {
    if !xid.is_valid() {
        return true; // frozen sentinel: always visible
    }
    matches!(txn.state(xid), Some(TxnState::Committed)) && snapshot.can_see_committed(xid)
}

/// Resolves the visible version of `tid` on `page` under `snapshot`.
pub fn resolve(page: &Page, undo: &UndoManager, txn: &TxnManager, tid: Tid, snapshot: &Snapshot) -> Result<Visibility> {
    let lp_idx = tid.offset - 1;
    let lp = page.line_pointer(lp_idx)?;

    let (current_xid, undo_ptr, current_payload) = match lp {
        LinePointer::Unused | LinePointer::Dead => return Ok(Visibility::Invisible),
        LinePointer::Deleted { slot_index } => {
            let slot = page.slot(slot_index)?;
            (slot.xid, slot.undo_ptr, None)
        }
        LinePointer::Normal { .. } => {
            let (header, payload) = HeapPage::get_tuple(page, lp_idx)?;
            let slot = page.slot(header.slot_index)?;
            (slot.xid, slot.undo_ptr, Some(payload.to_vec()))
        }
    };

    if committed_visible(txn, snapshot, current_xid) {
        return Ok(match current_payload {
            Some(payload) => Visibility::Visible(payload),
            None => Visibility::Invisible, // the delete itself is visible
        });
    }

    // Current state isn't visible (or the row is currently deleted):
    // unwind the undo chain looking for an older version this snapshot
    // can see.
    let mut ptr = undo_ptr;
    loop {
        if ptr.is_none() {
            return Ok(Visibility::Invisible);
        }
        let record = undo.fetch(ptr)?;

        if let UndoRecordBody::SlotReuse { old_undo_ptr, .. } = record.body {
            ptr = old_undo_ptr;
            continue;
        }

        if record.tid != tid {
            ptr = record.blkprev;
            continue;
        }

        match record.body {
            UndoRecordBody::Insert
            | UndoRecordBody::MultiInsert { .. }
            | UndoRecordBody::SpeculativeInsert { .. }
            | UndoRecordBody::SpeculativeAbort { .. }
            | UndoRecordBody::TransactionHeader { .. } => {
                return Ok(Visibility::Invisible);
            }
            UndoRecordBody::Delete { old_payload, .. }
            | UndoRecordBody::InPlaceUpdate { old_payload, .. }
            | UndoRecordBody::NonInPlaceUpdate { old_payload, .. } => {
                return Ok(Visibility::Visible(old_payload));
            }
            UndoRecordBody::Lock { .. } => {
                ptr = record.blkprev;
            }
            UndoRecordBody::SlotReuse { .. } => unreachable!("handled above"),
        }
    }
}
