//! Tuple header: the per-row metadata stored immediately before a tuple's
//! payload bytes in the tuple region.

use crate::error::{Result, StorageError};
use crate::types::SlotIndex;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Bit 0 of a tuple header's first info byte: a null bitmap follows the
/// header before the payload.
pub const INFO_HAS_NULLS: u8 = 1 << 0;
/// Tuple carries an out-of-line (TOAST-style) payload pointer.
pub const INFO_HAS_EXTERNAL: u8 = 1 << 1;

/// The last DML operation recorded against this tuple was an in-place
/// update (the payload here is the *new* image).
pub const INFO2_IN_PLACE_UPDATED: u8 = 1 << 0;
/// At least one row lock is held and reflected in the owning slot.
pub const INFO2_HAS_LOCK: u8 = 1 << 1;
/// More than one transaction holds a non-conflicting lock; the slot
/// reflects only the strongest one.
pub const INFO2_MULTI_LOCKER: u8 = 1 << 2;
/// Tuple is a provisional speculative insertion awaiting confirm/abort.
pub const INFO2_SPECULATIVE: u8 = 1 << 3;
/// The slot this tuple currently points at was reused and a slot-reuse
/// undo record was chained ahead of this tuple's own undo.
pub const INFO2_SLOT_REUSED: u8 = 1 << 4;

/// Header preceding every tuple payload in the tuple region (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    /// Owning transaction slot on this page.
    pub slot_index: SlotIndex,
    pub info: u8,
    pub info2: u8,
    /// Byte offset from the start of the tuple to the payload, i.e. past
    /// any null bitmap.
    pub data_offset: u8,
    /// Actual payload length in bytes. Kept separate from the line
    /// pointer's reservation length so an in-place update can shrink the
    /// logical tuple without giving up the byte range a later update
    /// might need to grow back into.
    pub payload_len: u16,
}

impl TupleHeader {
    /// slot_index(2) + info(1) + info2(1) + data_offset(1) + payload_len(2)
    /// + one pad byte, keeping the header 2-byte aligned.
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn has_nulls(&self) -> bool {
        self.info & INFO_HAS_NULLS != 0
    }

    #[must_use]
    pub fn in_place_updated(&self) -> bool {
        self.info2 & INFO2_IN_PLACE_UPDATED != 0
    }

    #[must_use]
    pub fn is_speculative(&self) -> bool {
        self.info2 & INFO2_SPECULATIVE != 0
    }

    pub(crate) fn encode(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for tuple header".into()));
        }
        let mut cursor = Cursor::new(buf);
        cursor
            .write_u16::<LittleEndian>(self.slot_index.0)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u8(self.info).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u8(self.info2).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u8(self.data_offset).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor
            .write_u16::<LittleEndian>(self.payload_len)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u8(0).map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for tuple header".into()));
        }
        let mut cursor = Cursor::new(buf);
        let slot_index =
            SlotIndex(cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?);
        let info = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let info2 = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let data_offset = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let payload_len =
            cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(Self { slot_index, info, info2, data_offset, payload_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let h = TupleHeader {
            slot_index: SlotIndex(3),
            info: INFO_HAS_NULLS,
            info2: INFO2_IN_PLACE_UPDATED | INFO2_HAS_LOCK,
            data_offset: 8,
            payload_len: 42,
        };
        let mut buf = [0u8; TupleHeader::SIZE];
        h.encode(&mut buf).unwrap();
        let decoded = TupleHeader::decode(&buf).unwrap();
        assert_eq!(decoded, h);
        assert!(decoded.has_nulls());
        assert!(decoded.in_place_updated());
    }

    #[test]
    fn speculative_flag_observable() {
        let h = TupleHeader { slot_index: SlotIndex(1), info: 0, info2: INFO2_SPECULATIVE, data_offset: 6, payload_len: 0 };
        assert!(h.is_speculative());
    }
}
