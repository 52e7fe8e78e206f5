//! Page-level mechanics shared by the DML kernel, pruning pass, and
//! visibility resolver: placing a tuple image, reading one back, and
//! retiring a line pointer. Kept free of any transaction or undo
//! knowledge; callers own the undo record that justifies each mutation.

use super::{LinePointer, Page, PageHeader, TupleHeader};
use crate::error::{Result, StorageError};
use crate::types::SlotIndex;

/// Namespace for static operations over a [`Page`], mirroring the
/// teacher's style of grouping byte-layout logic as free functions on a
/// zero-sized type rather than methods that would force every caller
/// through a single struct's borrow.
pub struct HeapPage;

impl HeapPage {
    /// Decides which line pointer index an insert of `payload_len` bytes
    /// would be assigned, and checks the page has room for it, without
    /// mutating anything. Lets a caller learn the real `Tid` before writing
    /// its undo record, while the tuple itself is placed afterwards by
    /// [`Self::insert_tuple`] (spec §4.5 step 1 precedes step 3).
    pub fn peek_insert_line_pointer(page: &Page, payload_len: usize) -> Result<u16> {
        let header = page.header();
        let (lp_idx, needs_new_lp) = Self::plan_insert(page, &header);
        let required = TupleHeader::SIZE + payload_len + if needs_new_lp { super::line_pointer::LinePointer::SIZE } else { 0 };
        if (header.free_end as usize).saturating_sub(header.free_start as usize) < required {
            return Err(StorageError::OutOfPageSpace(format!(
                "need {required} bytes, have {}",
                header.free_end.saturating_sub(header.free_start)
            )));
        }
        Ok(lp_idx)
    }

    fn plan_insert(page: &Page, header: &PageHeader) -> (u16, bool) {
        match Self::find_unused_line_pointer(page, header.line_pointer_count) {
            Some(idx) => (idx, false),
            None => (header.line_pointer_count, true),
        }
    }

    /// Writes `payload` (already including its [`TupleHeader`] prefix) into
    /// the page's tuple region and returns the line pointer index now
    /// referencing it. Reuses an `Unused` line pointer slot if one exists,
    /// otherwise grows the array. The caller is expected to have already
    /// validated space (and learned the assigned index, if it needs it
    /// ahead of time) via [`Self::peek_insert_line_pointer`].
    pub fn insert_tuple(page: &mut Page, slot_index: SlotIndex, payload: &[u8]) -> Result<u16> {
        let tuple_len = TupleHeader::SIZE + payload.len();
        let mut header = page.header();

        let needs_new_lp = Self::find_unused_line_pointer(page, header.line_pointer_count).is_none();
        let lp_growth = if needs_new_lp { super::line_pointer::LinePointer::SIZE } else { 0 };
        let required = tuple_len + lp_growth;
        if (header.free_end as usize).saturating_sub(header.free_start as usize) < required {
            return Err(StorageError::OutOfPageSpace(format!(
                "need {required} bytes, have {}",
                header.free_end.saturating_sub(header.free_start)
            )));
        }

        let tuple_offset = header.free_end as usize - tuple_len;
        let th = TupleHeader {
            slot_index,
            info: 0,
            info2: 0,
            data_offset: TupleHeader::SIZE as u8,
            payload_len: payload.len() as u16,
        };
        th.encode(&mut page.data[tuple_offset..tuple_offset + TupleHeader::SIZE])?;
        page.data[tuple_offset + TupleHeader::SIZE..tuple_offset + tuple_len].copy_from_slice(payload);

        let lp_idx = match Self::find_unused_line_pointer(page, header.line_pointer_count) {
            Some(idx) => idx,
            None => {
                let idx = header.line_pointer_count;
                header.line_pointer_count += 1;
                header.free_start += super::line_pointer::LinePointer::SIZE as u16;
                idx
            }
        };
        header.free_end = tuple_offset as u16;
        page.set_header(header)?;
        page.set_line_pointer(
            lp_idx,
            LinePointer::Normal { offset: tuple_offset as u16, length: tuple_len as u16 },
        )?;
        Ok(lp_idx)
    }

    fn find_unused_line_pointer(page: &Page, count: u16) -> Option<u16> {
        (0..count).find(|&i| matches!(page.line_pointer(i), Ok(LinePointer::Unused)))
    }

    /// Reads back the tuple header and payload referenced by a `Normal`
    /// line pointer. The payload slice is bounded by the header's own
    /// `payload_len`, not the line pointer's (possibly larger) reserved
    /// length.
    pub fn get_tuple(page: &Page, lp_idx: u16) -> Result<(TupleHeader, &[u8])> {
        match page.line_pointer(lp_idx)? {
            LinePointer::Normal { offset, .. } => {
                let offset = offset as usize;
                let header = TupleHeader::decode(&page.data[offset..offset + TupleHeader::SIZE])?;
                let payload_start = offset + TupleHeader::SIZE;
                let payload_end = payload_start + header.payload_len as usize;
                Ok((header, &page.data[payload_start..payload_end]))
            }
            other => Err(StorageError::NotFound(format!("line pointer {lp_idx} is not live: {other:?}"))),
        }
    }

    /// Overwrites a tuple's header in place without moving the line
    /// pointer or payload bytes; used when only flags or the owning slot
    /// index change (e.g. recording a lock or a slot reuse).
    pub fn rewrite_tuple_header(page: &mut Page, lp_idx: u16, header: TupleHeader) -> Result<()> {
        match page.line_pointer(lp_idx)? {
            LinePointer::Normal { offset, .. } => {
                let offset = offset as usize;
                header.encode(&mut page.data[offset..offset + TupleHeader::SIZE])
            }
            other => Err(StorageError::NotFound(format!("line pointer {lp_idx} is not live: {other:?}"))),
        }
    }

    /// Replaces a tuple's payload with a same-size-or-smaller new image at
    /// the same offset, for an in-place update. Callers must already have
    /// verified the new payload fits in the original tuple's reserved
    /// length; growing payloads go through a non-in-place update instead.
    ///
    /// The line pointer's `length` stays at the original reservation size
    /// so a rollback can later grow back into any of it; the header's own
    /// `payload_len` is what bounds reads, so shrinkage is immediately
    /// visible to `get_tuple` without needing pruning to run first.
    pub fn update_in_place(page: &mut Page, lp_idx: u16, mut header: TupleHeader, payload: &[u8]) -> Result<()> {
        let old_length = match page.line_pointer(lp_idx)? {
            LinePointer::Normal { length, .. } => length as usize,
            other => return Err(StorageError::NotFound(format!("line pointer {lp_idx} is not live: {other:?}"))),
        };
        let new_len = TupleHeader::SIZE + payload.len();
        if new_len > old_length {
            return Err(StorageError::OutOfPageSpace(format!(
                "in-place update payload grew from {old_length} to {new_len} bytes"
            )));
        }
        let offset = match page.line_pointer(lp_idx)? {
            LinePointer::Normal { offset, .. } => offset as usize,
            _ => unreachable!(),
        };
        header.payload_len = payload.len() as u16;
        header.encode(&mut page.data[offset..offset + TupleHeader::SIZE])?;
        page.data[offset + TupleHeader::SIZE..offset + new_len].copy_from_slice(payload);
        Ok(())
    }

    /// Writes `payload` back into a still-`Normal` tuple's existing
    /// reservation, for the rollback engine undoing an in-place update.
    /// Unlike [`Self::update_in_place`], the caller need not have tracked
    /// the original payload length itself; any size up to the line
    /// pointer's reserved length is accepted, since the case being undone
    /// may itself have been a shrink.
    pub fn restore_tuple(page: &mut Page, lp_idx: u16, mut header: TupleHeader, payload: &[u8]) -> Result<()> {
        let (offset, length) = match page.line_pointer(lp_idx)? {
            LinePointer::Normal { offset, length } => (offset as usize, length as usize),
            other => return Err(StorageError::NotFound(format!("line pointer {lp_idx} is not live: {other:?}"))),
        };
        let new_len = TupleHeader::SIZE + payload.len();
        if new_len > length {
            return Err(StorageError::InvalidInput(format!(
                "restored payload of {new_len} bytes does not fit the {length}-byte reservation"
            )));
        }
        header.payload_len = payload.len() as u16;
        header.encode(&mut page.data[offset..offset + TupleHeader::SIZE])?;
        page.data[offset + TupleHeader::SIZE..offset + new_len].copy_from_slice(payload);
        Ok(())
    }

    /// Re-places a tuple's bytes for a line pointer currently `Dead` or
    /// `Deleted`, for the rollback engine undoing a delete. A delete does
    /// not preserve the original offset in the line pointer, so this
    /// allocates fresh tuple-region space exactly like [`Self::insert_tuple`]
    /// but reuses `lp_idx` instead of handing out a new one, keeping the
    /// row's `Tid` stable across the undo.
    pub fn undelete_tuple(page: &mut Page, lp_idx: u16, slot_index: SlotIndex, payload: &[u8]) -> Result<()> {
        match page.line_pointer(lp_idx)? {
            LinePointer::Dead | LinePointer::Deleted { .. } => {}
            other => {
                return Err(StorageError::InvalidInput(format!(
                    "line pointer {lp_idx} is not dead/deleted, cannot undelete: {other:?}"
                )))
            }
        }
        let tuple_len = TupleHeader::SIZE + payload.len();
        let mut header = page.header();
        if (header.free_end as usize).saturating_sub(header.free_start as usize) < tuple_len {
            return Err(StorageError::OutOfPageSpace(format!(
                "need {tuple_len} bytes to undelete, have {}",
                header.free_end.saturating_sub(header.free_start)
            )));
        }
        let tuple_offset = header.free_end as usize - tuple_len;
        let th = TupleHeader {
            slot_index,
            info: 0,
            info2: 0,
            data_offset: TupleHeader::SIZE as u8,
            payload_len: payload.len() as u16,
        };
        th.encode(&mut page.data[tuple_offset..tuple_offset + TupleHeader::SIZE])?;
        page.data[tuple_offset + TupleHeader::SIZE..tuple_offset + tuple_len].copy_from_slice(payload);
        header.free_end = tuple_offset as u16;
        page.set_header(header)?;
        page.set_line_pointer(lp_idx, LinePointer::Normal { offset: tuple_offset as u16, length: tuple_len as u16 })?;
        Ok(())
    }

    /// Marks a line pointer `Dead`: the tuple bytes are logically gone but
    /// the slot stays occupied until pruning compacts the tuple region.
    pub fn mark_dead(page: &mut Page, lp_idx: u16) -> Result<()> {
        page.set_line_pointer(lp_idx, LinePointer::Dead)
    }

    /// Marks a line pointer `Unused`, immediately available for reuse by a
    /// later insert. Used for a row no other transaction could ever have
    /// seen, where waiting for pruning to reclaim it would be pointless.
    pub fn mark_unused(page: &mut Page, lp_idx: u16) -> Result<()> {
        page.set_line_pointer(lp_idx, LinePointer::Unused)
    }

    /// Marks a line pointer `Deleted`, recording which transaction slot
    /// owns the undo chain a visibility check must walk to find the row's
    /// pre-delete image.
    pub fn mark_deleted(page: &mut Page, lp_idx: u16, owning_slot: SlotIndex) -> Result<()> {
        page.set_line_pointer(lp_idx, LinePointer::Deleted { slot_index: owning_slot })
    }

    /// Compacts the tuple region, squeezing out dead tuples' bytes while
    /// leaving every line pointer's index and logical state intact —
    /// pruning relocates tuple bytes but never renumbers rows, so `Tid`s
    /// already handed out to callers or stored in indexes stay valid.
    pub fn compact(page: &mut Page, reclaimable: &[u16]) -> Result<usize> {
        let mut header = page.header();
        let mut entries: Vec<(u16, u16, u16)> = Vec::new();
        for i in 0..header.line_pointer_count {
            if let LinePointer::Normal { offset, length } = page.line_pointer(i)? {
                entries.push((i, offset, length));
            }
        }
        entries.sort_by_key(|&(_, offset, _)| std::cmp::Reverse(offset));

        let page_size = page.data.len();
        let mut write_cursor = page_size;
        let mut reclaimed = 0usize;
        let mut moves = Vec::new();
        for (idx, offset, length) in entries {
            if reclaimable.contains(&idx) {
                reclaimed += length as usize;
                continue;
            }
            write_cursor -= length as usize;
            moves.push((idx, offset as usize, write_cursor, length));
        }

        // Apply moves high-to-low source offsets into descending
        // destinations; since destinations are always >= sources (we only
        // ever reclaim space, never expand), forward byte copies per
        // region are safe without an intermediate buffer.
        let mut scratch = vec![0u8; page_size];
        scratch.copy_from_slice(&page.data);
        for (_idx, src, dst, length) in &moves {
            scratch.copy_within(*src..*src + *length as usize, *dst);
        }
        page.data.copy_from_slice(&scratch);

        for (idx, _src, dst, length) in moves {
            page.set_line_pointer(idx, LinePointer::Normal { offset: dst as u16, length })?;
        }
        for &idx in reclaimable {
            page.set_line_pointer(idx, LinePointer::Unused)?;
        }

        header.free_end = write_cursor as u16;
        page.set_header(header)?;
        Ok(reclaimed)
    }

    #[must_use]
    pub fn header(page: &Page) -> PageHeader {
        page.header()
    }
}
