//! Undo record codec.
//!
//! Every record is length-prefixed *and* length-suffixed so the rollback
//! engine and the visibility resolver can walk a transaction's chain
//! backwards from its latest `UndoPtr` without an index: read the last 4
//! bytes of a record's slot to learn where it began, then read the
//! `prev`/`blkprev` pointers in its fixed header to continue the walk one
//! hop further back.

use crate::error::{Result, StorageError};
use crate::types::{SpeculativeToken, Tid, UndoPtr, Xid};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// The operation an undo record reverses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecordBody {
    /// First record a transaction writes; anchors the per-transaction undo
    /// chain and records which database/table the chain belongs to.
    TransactionHeader { dbid: u32 },
    /// Reverses an insert: on undo, the line pointer is marked `Unused`.
    Insert,
    /// Reverses a speculative insert: same as `Insert`, but carries the
    /// token the inserter will later use to confirm or abort the row, so a
    /// transaction-level rollback that overtakes an unresolved speculative
    /// insert can still identify which insert it was.
    SpeculativeInsert { token: SpeculativeToken },
    /// Records that a speculative insert was unwound immediately rather
    /// than through transaction rollback. Applying this during rollback is
    /// a no-op since the page already reflects the abort by the time this
    /// record would be walked.
    SpeculativeAbort { token: SpeculativeToken },
    /// Reverses a delete: on undo, the stored pre-delete tuple image is
    /// written back and the line pointer returns to `Normal`.
    Delete { old_payload: Vec<u8>, old_info: u8, old_info2: u8 },
    /// Reverses an in-place update: the previous tuple image is restored
    /// over the current one at the same offset.
    InPlaceUpdate { old_payload: Vec<u8>, old_info: u8, old_info2: u8 },
    /// Reverses a non-in-place update: the old page's line pointer is
    /// restored from `Deleted` back to `Normal` with the prior image; the
    /// new tuple id is retained so the forward chain can be traced.
    NonInPlaceUpdate { old_payload: Vec<u8>, old_info: u8, old_info2: u8, new_tid: Tid },
    /// Reverses a bulk insert of `count` tuples whose line pointers began
    /// at `first_lp`, letting them all be marked `Unused` in one record.
    MultiInsert { first_lp: u16, count: u16 },
    /// Reverses a row lock: restores the previous info2 lock flags.
    Lock { old_info2: u8 },
    /// Preserves a transaction slot's previous occupant before it is
    /// reused, so a lagging snapshot can still resolve visibility for
    /// tuples that pointed at the old occupant, and so a rollback of the
    /// reusing transaction knows which slot to hand back.
    SlotReuse { slot_index: u16, old_xid: Xid, old_undo_ptr: UndoPtr },
}

impl UndoRecordBody {
    const TAG_TXN_HEADER: u8 = 0;
    const TAG_INSERT: u8 = 1;
    const TAG_DELETE: u8 = 2;
    const TAG_IN_PLACE_UPDATE: u8 = 3;
    const TAG_NON_IN_PLACE_UPDATE: u8 = 4;
    const TAG_MULTI_INSERT: u8 = 5;
    const TAG_LOCK: u8 = 6;
    const TAG_SLOT_REUSE: u8 = 7;
    const TAG_SPECULATIVE_INSERT: u8 = 8;
    const TAG_SPECULATIVE_ABORT: u8 = 9;

    fn tag(&self) -> u8 {
        match self {
            Self::TransactionHeader { .. } => Self::TAG_TXN_HEADER,
            Self::Insert => Self::TAG_INSERT,
            Self::Delete { .. } => Self::TAG_DELETE,
            Self::InPlaceUpdate { .. } => Self::TAG_IN_PLACE_UPDATE,
            Self::NonInPlaceUpdate { .. } => Self::TAG_NON_IN_PLACE_UPDATE,
            Self::MultiInsert { .. } => Self::TAG_MULTI_INSERT,
            Self::Lock { .. } => Self::TAG_LOCK,
            Self::SlotReuse { .. } => Self::TAG_SLOT_REUSE,
            Self::SpeculativeInsert { .. } => Self::TAG_SPECULATIVE_INSERT,
            Self::SpeculativeAbort { .. } => Self::TAG_SPECULATIVE_ABORT,
        }
    }

    fn write_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Self::TransactionHeader { dbid } => {
                w.write_u32::<LittleEndian>(*dbid).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
            Self::Insert => {}
            Self::SpeculativeInsert { token } | Self::SpeculativeAbort { token } => {
                w.write_u32::<LittleEndian>(*token).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
            Self::Delete { old_payload, old_info, old_info2 }
            | Self::InPlaceUpdate { old_payload, old_info, old_info2 } => {
                w.write_u8(*old_info).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u8(*old_info2).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u32::<LittleEndian>(old_payload.len() as u32)
                    .map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_all(old_payload).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
            Self::NonInPlaceUpdate { old_payload, old_info, old_info2, new_tid } => {
                w.write_u8(*old_info).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u8(*old_info2).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u32::<LittleEndian>(new_tid.block).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u16::<LittleEndian>(new_tid.offset).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u32::<LittleEndian>(old_payload.len() as u32)
                    .map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_all(old_payload).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
            Self::MultiInsert { first_lp, count } => {
                w.write_u16::<LittleEndian>(*first_lp).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u16::<LittleEndian>(*count).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
            Self::Lock { old_info2 } => {
                w.write_u8(*old_info2).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
            Self::SlotReuse { slot_index, old_xid, old_undo_ptr } => {
                w.write_u16::<LittleEndian>(*slot_index).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u64::<LittleEndian>(old_xid.0).map_err(|e| StorageError::Codec(e.to_string()))?;
                w.write_u64::<LittleEndian>(old_undo_ptr.0).map_err(|e| StorageError::Codec(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn read_payload<R: Read>(tag: u8, r: &mut R) -> Result<Self> {
        match tag {
            Self::TAG_TXN_HEADER => {
                let dbid = r.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Self::TransactionHeader { dbid })
            }
            Self::TAG_INSERT => Ok(Self::Insert),
            Self::TAG_SPECULATIVE_INSERT => {
                let token = r.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Self::SpeculativeInsert { token })
            }
            Self::TAG_SPECULATIVE_ABORT => {
                let token = r.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Self::SpeculativeAbort { token })
            }
            Self::TAG_DELETE | Self::TAG_IN_PLACE_UPDATE => {
                let old_info = r.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
                let old_info2 = r.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
                let len = r.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))? as usize;
                let mut old_payload = vec![0u8; len];
                r.read_exact(&mut old_payload).map_err(|e| StorageError::Codec(e.to_string()))?;
                if tag == Self::TAG_DELETE {
                    Ok(Self::Delete { old_payload, old_info, old_info2 })
                } else {
                    Ok(Self::InPlaceUpdate { old_payload, old_info, old_info2 })
                }
            }
            Self::TAG_NON_IN_PLACE_UPDATE => {
                let old_info = r.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
                let old_info2 = r.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
                let block = r.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                let offset = r.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                let len = r.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))? as usize;
                let mut old_payload = vec![0u8; len];
                r.read_exact(&mut old_payload).map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Self::NonInPlaceUpdate { old_payload, old_info, old_info2, new_tid: Tid::new(block, offset) })
            }
            Self::TAG_MULTI_INSERT => {
                let first_lp = r.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                let count = r.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Self::MultiInsert { first_lp, count })
            }
            Self::TAG_LOCK => {
                let old_info2 = r.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
                Ok(Self::Lock { old_info2 })
            }
            Self::TAG_SLOT_REUSE => {
                let slot_index = r.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
                let old_xid = Xid(r.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
                let old_undo_ptr =
                    UndoPtr(r.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
                Ok(Self::SlotReuse { slot_index, old_xid, old_undo_ptr })
            }
            other => Err(StorageError::Corruption(format!("unknown undo record tag {other}"))),
        }
    }
}

/// One undo record: a fixed header plus a variant-specific body, framed by
/// matching length fields at both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub xid: Xid,
    pub tid: Tid,
    /// Previous undo record written by the same transaction, or
    /// `UndoPtr::NONE` if this is the transaction's first.
    pub prev: UndoPtr,
    /// Previous undo record touching the same page, or `UndoPtr::NONE`.
    pub blkprev: UndoPtr,
    pub body: UndoRecordBody,
}

impl UndoRecord {
    /// xid(8) + tid(6) + prev(8) + blkprev(8) + tag(1) = fixed header size
    /// ahead of the variant payload.
    const FIXED_HEADER_SIZE: usize = 8 + 6 + 8 + 8 + 1;
    /// Leading and trailing length fields.
    const FRAME_SIZE: usize = 4 + 4;

    /// Serializes this record and returns the bytes to append to a log
    /// segment.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body_buf = Vec::new();
        body_buf
            .write_u64::<LittleEndian>(self.xid.0)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        body_buf
            .write_u32::<LittleEndian>(self.tid.block)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        body_buf
            .write_u16::<LittleEndian>(self.tid.offset)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        body_buf
            .write_u64::<LittleEndian>(self.prev.0)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        body_buf
            .write_u64::<LittleEndian>(self.blkprev.0)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        body_buf.write_u8(self.body.tag()).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.body.write_payload(&mut body_buf)?;

        let total_len = (Self::FRAME_SIZE + body_buf.len()) as u32;

        let mut out = Vec::with_capacity(total_len as usize);
        out.write_u32::<LittleEndian>(total_len).map_err(|e| StorageError::Codec(e.to_string()))?;
        out.extend_from_slice(&body_buf);
        out.write_u32::<LittleEndian>(total_len).map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(out)
    }

    /// Decodes a record whose framing length prefix has already been read
    /// from `buf[0..4]`; `buf` must contain exactly `total_len` bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FRAME_SIZE + Self::FIXED_HEADER_SIZE {
            return Err(StorageError::Codec("undo record buffer truncated".into()));
        }
        let mut cursor = Cursor::new(&buf[4..buf.len() - 4]);
        let xid = Xid(cursor.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
        let block = cursor.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let offset = cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let prev = UndoPtr(cursor.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
        let blkprev =
            UndoPtr(cursor.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
        let tag = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let body = UndoRecordBody::read_payload(tag, &mut cursor)?;

        let leading_len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let trailing_len = u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap());
        if leading_len != trailing_len || leading_len as usize != buf.len() {
            return Err(StorageError::Corruption("undo record length framing mismatch".into()));
        }

        Ok(Self { xid, tid: Tid::new(block, offset), prev, blkprev, body })
    }

    /// Reads the trailing length field of the record ending at byte
    /// `end` (exclusive) in `segment`, used to walk a log backwards one
    /// record at a time without a separate index.
    pub fn trailing_length(segment: &[u8], end: usize) -> Result<u32> {
        if end < 4 {
            return Err(StorageError::Corruption("undo segment truncated before record trailer".into()));
        }
        Ok(u32::from_le_bytes(segment[end - 4..end].try_into().unwrap()))
    }
}
