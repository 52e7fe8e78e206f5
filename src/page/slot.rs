//! Per-page transaction slot array.
//!
//! Each page carries a small, fixed-size array of 16-byte slots in its
//! special area. A tuple references its owning transaction indirectly
//! through a `SlotIndex` rather than embedding an `Xid` in every tuple
//! header, so committing or aborting a transaction never requires touching
//! every tuple it wrote.

use crate::error::{Result, StorageError};
use crate::types::{SlotIndex, UndoPtr, Xid};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// One entry in a page's transaction slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionSlot {
    pub xid: Xid,
    pub undo_ptr: UndoPtr,
}

impl TransactionSlot {
    /// Exactly 16 bytes: an 8-byte `Xid` and an 8-byte `UndoPtr`.
    pub const SIZE: usize = 16;

    /// The permanently frozen sentinel occupying slot 0 of every page.
    pub const FROZEN: Self = Self { xid: Xid::INVALID, undo_ptr: UndoPtr::NONE };

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.xid.is_valid()
    }

    pub(crate) fn encode(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for transaction slot".into()));
        }
        let mut cursor = Cursor::new(buf);
        cursor.write_u64::<LittleEndian>(self.xid.0).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor
            .write_u64::<LittleEndian>(self.undo_ptr.0)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for transaction slot".into()));
        }
        let mut cursor = Cursor::new(buf);
        let xid = Xid(cursor.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
        let undo_ptr =
            UndoPtr(cursor.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
        Ok(Self { xid, undo_ptr })
    }
}

/// What the slot manager needs to know about a transaction to decide
/// whether its slot can be reused. Implemented by `txn::manager::TxnManager`
/// so this module stays ignorant of how transaction state is tracked.
pub trait TransactionStatusLookup {
    /// The transaction committed and every tuple it wrote is visible to
    /// every running snapshot; its slot can be reused without leaving a
    /// trace.
    fn is_committed_all_visible(&self, xid: Xid) -> bool;
    /// The transaction committed but some running snapshot might still
    /// need to see its old slot contents; reusing the slot requires a
    /// slot-reuse undo record first.
    fn is_committed_not_all_visible(&self, xid: Xid) -> bool;
    /// The transaction aborted and its undo has already been applied; the
    /// slot is free for immediate reuse.
    fn is_aborted_and_undone(&self, xid: Xid) -> bool;
}

/// Outcome of [`find_or_allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquisition {
    /// An existing slot already belongs to `xid`.
    Reused(SlotIndex),
    /// A free or reclaimable slot was (re)assigned to `xid`.
    Allocated(SlotIndex),
    /// Reusing `victim` requires emitting a slot-reuse undo record before
    /// the caller may proceed; the caller must do that and then retry.
    NeedsSlotReuseUndo { victim: SlotIndex, victim_xid: Xid },
}

/// Scans a page's slot array (as raw 16-byte entries) for one already
/// owned by `xid`, or for one safe to (re)allocate. Mirrors the real
/// engine's avoidance of blocking inside a critical section: when every
/// slot is busy with a live transaction, the caller gets `SlotExhausted`
/// and is expected to release its page content lock and retry rather than
/// wait while holding it.
pub fn find_or_allocate(
    slots: &[TransactionSlot],
    xid: Xid,
    status: &dyn TransactionStatusLookup,
) -> Result<SlotAcquisition> {
    for (idx, slot) in slots.iter().enumerate() {
        if idx == 0 {
            continue; // slot 0 is the frozen sentinel, never assigned
        }
        if slot.xid == xid {
            return Ok(SlotAcquisition::Reused(SlotIndex(idx as u16)));
        }
    }

    // No existing slot. Prefer a genuinely empty one, then one that is
    // freely reclaimable, before falling back to one that needs a
    // slot-reuse undo record.
    for (idx, slot) in slots.iter().enumerate() {
        if idx == 0 {
            continue;
        }
        if slot.is_empty() || status.is_aborted_and_undone(slot.xid) || status.is_committed_all_visible(slot.xid) {
            return Ok(SlotAcquisition::Allocated(SlotIndex(idx as u16)));
        }
    }

    for (idx, slot) in slots.iter().enumerate() {
        if idx == 0 {
            continue;
        }
        if status.is_committed_not_all_visible(slot.xid) {
            return Ok(SlotAcquisition::NeedsSlotReuseUndo {
                victim: SlotIndex(idx as u16),
                victim_xid: slot.xid,
            });
        }
    }

    Err(StorageError::SlotExhausted(format!(
        "no free or reclaimable slot among {} slots for xid {xid}",
        slots.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStatus {
        all_visible: Vec<Xid>,
        not_all_visible: Vec<Xid>,
        undone: Vec<Xid>,
    }

    impl TransactionStatusLookup for FixedStatus {
        fn is_committed_all_visible(&self, xid: Xid) -> bool {
            self.all_visible.contains(&xid)
        }
        fn is_committed_not_all_visible(&self, xid: Xid) -> bool {
            self.not_all_visible.contains(&xid)
        }
        fn is_aborted_and_undone(&self, xid: Xid) -> bool {
            self.undone.contains(&xid)
        }
    }

    #[test]
    fn slot_roundtrips() {
        let s = TransactionSlot { xid: Xid::new(0, 7), undo_ptr: UndoPtr::new(1, 500) };
        let mut buf = [0u8; TransactionSlot::SIZE];
        s.encode(&mut buf).unwrap();
        assert_eq!(TransactionSlot::decode(&buf).unwrap(), s);
    }

    #[test]
    fn reuses_own_slot() {
        let xid = Xid::new(0, 5);
        let slots = vec![
            TransactionSlot::FROZEN,
            TransactionSlot { xid, undo_ptr: UndoPtr::new(0, 10) },
            TransactionSlot { xid: Xid::INVALID, undo_ptr: UndoPtr::NONE },
        ];
        let status = FixedStatus { all_visible: vec![], not_all_visible: vec![], undone: vec![] };
        assert_eq!(find_or_allocate(&slots, xid, &status).unwrap(), SlotAcquisition::Reused(SlotIndex(1)));
    }

    #[test]
    fn allocates_empty_slot_over_reuse() {
        let other = Xid::new(0, 9);
        let slots = vec![
            TransactionSlot::FROZEN,
            TransactionSlot { xid: other, undo_ptr: UndoPtr::new(0, 1) },
            TransactionSlot { xid: Xid::INVALID, undo_ptr: UndoPtr::NONE },
        ];
        let status = FixedStatus {
            all_visible: vec![],
            not_all_visible: vec![other],
            undone: vec![],
        };
        assert_eq!(
            find_or_allocate(&slots, Xid::new(0, 20), &status).unwrap(),
            SlotAcquisition::Allocated(SlotIndex(2))
        );
    }

    #[test]
    fn falls_back_to_slot_reuse_undo_when_full() {
        let victim = Xid::new(0, 9);
        let slots =
            vec![TransactionSlot::FROZEN, TransactionSlot { xid: victim, undo_ptr: UndoPtr::new(0, 1) }];
        let status = FixedStatus { all_visible: vec![], not_all_visible: vec![victim], undone: vec![] };
        assert_eq!(
            find_or_allocate(&slots, Xid::new(0, 20), &status).unwrap(),
            SlotAcquisition::NeedsSlotReuseUndo { victim: SlotIndex(1), victim_xid: victim }
        );
    }

    #[test]
    fn exhausted_when_every_slot_is_live() {
        let live = Xid::new(0, 9);
        let slots = vec![TransactionSlot::FROZEN, TransactionSlot { xid: live, undo_ptr: UndoPtr::new(0, 1) }];
        let status = FixedStatus { all_visible: vec![], not_all_visible: vec![], undone: vec![] };
        assert!(matches!(
            find_or_allocate(&slots, Xid::new(0, 20), &status),
            Err(StorageError::SlotExhausted(_))
        ));
    }
}
