//! Line pointer array: one fixed-size entry per logical row slot on a page.

use crate::error::{Result, StorageError};
use crate::types::SlotIndex;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// State of one row slot on a page (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinePointer {
    /// Slot never used, or reclaimed by pruning.
    Unused,
    /// Points at a live tuple payload.
    Normal { offset: u16, length: u16 },
    /// Tuple destroyed; awaiting index cleanup before the slot can be
    /// reused.
    Dead,
    /// Committed-but-not-all-visible delete. The prior version is still
    /// reachable through the named slot's undo chain.
    Deleted { slot_index: SlotIndex },
}

impl LinePointer {
    /// On-disk size: a tag byte, a reserved byte, and two u16 payload
    /// fields.
    pub const SIZE: usize = 1 + 1 + 2 + 2;

    const TAG_UNUSED: u8 = 0;
    const TAG_NORMAL: u8 = 1;
    const TAG_DEAD: u8 = 2;
    const TAG_DELETED: u8 = 3;

    pub(crate) fn encode(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for line pointer".into()));
        }
        let mut cursor = Cursor::new(buf);
        let (tag, a, b) = match self {
            Self::Unused => (Self::TAG_UNUSED, 0u16, 0u16),
            Self::Normal { offset, length } => (Self::TAG_NORMAL, offset, length),
            Self::Dead => (Self::TAG_DEAD, 0u16, 0u16),
            Self::Deleted { slot_index } => (Self::TAG_DELETED, slot_index.0, 0u16),
        };
        cursor.write_u8(tag).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u8(0).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u16::<LittleEndian>(a).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u16::<LittleEndian>(b).map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for line pointer".into()));
        }
        let mut cursor = Cursor::new(buf);
        let tag = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let _reserved = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let a = cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let b = cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        match tag {
            Self::TAG_UNUSED => Ok(Self::Unused),
            Self::TAG_NORMAL => Ok(Self::Normal { offset: a, length: b }),
            Self::TAG_DEAD => Ok(Self::Dead),
            Self::TAG_DELETED => Ok(Self::Deleted { slot_index: SlotIndex(a) }),
            other => Err(StorageError::Corruption(format!("invalid line pointer tag {other}"))),
        }
    }

    #[must_use]
    pub const fn is_normal(self) -> bool {
        matches!(self, Self::Normal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_roundtrips() {
        let lp = LinePointer::Normal { offset: 100, length: 42 };
        let mut buf = [0u8; LinePointer::SIZE];
        lp.encode(&mut buf).unwrap();
        assert_eq!(LinePointer::decode(&buf).unwrap(), lp);
    }

    #[test]
    fn deleted_carries_slot_index() {
        let lp = LinePointer::Deleted { slot_index: SlotIndex(2) };
        let mut buf = [0u8; LinePointer::SIZE];
        lp.encode(&mut buf).unwrap();
        assert_eq!(LinePointer::decode(&buf).unwrap(), lp);
    }

    #[test]
    fn unused_is_default_like() {
        let mut buf = [0u8; LinePointer::SIZE];
        LinePointer::Unused.encode(&mut buf).unwrap();
        assert_eq!(LinePointer::decode(&buf).unwrap(), LinePointer::Unused);
    }

    #[test]
    fn decode_rejects_bad_tag() {
        let mut buf = [0u8; LinePointer::SIZE];
        buf[0] = 200;
        assert!(matches!(LinePointer::decode(&buf), Err(StorageError::Corruption(_))));
    }
}
