//! On-disk page layout: header, upward-growing line pointer array,
//! downward-growing tuple region, and a special area at the tail of the
//! page holding the transaction slot array (spec §3).

pub mod heap_page;
pub mod line_pointer;
pub mod slot;
pub mod tuple;

pub use heap_page::HeapPage;
pub use line_pointer::LinePointer;
pub use slot::{SlotAcquisition, TransactionSlot, TransactionStatusLookup};
pub use tuple::TupleHeader;

use crate::error::{Result, StorageError};
use crate::types::Lsn;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Fixed-size header at offset 0 of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Layout version, bumped on incompatible on-disk format changes.
    pub version: u8,
    /// Bit 0: this page is an overflow page for another page's slot array.
    pub flags: u8,
    /// Tuples last pruned by a transaction older than this are assumed
    /// fully reclaimable; advanced by the pruning pass (spec §4.7).
    pub prune_xid_hint: u32,
    /// LSN of the most recent WAL record that touched this page.
    pub lsn: Lsn,
    /// Number of entries in the line pointer array, including unused ones.
    pub line_pointer_count: u16,
    /// Offset just past the last line pointer entry (start of free space).
    pub free_start: u16,
    /// Offset of the lowest-addressed live tuple (end of free space).
    pub free_end: u16,
    /// Offset where the special area (transaction slots) begins.
    pub special_start: u16,
}

impl PageHeader {
    pub const SIZE: usize = 1 + 1 + 4 + 8 + 2 + 2 + 2 + 2;
    const CURRENT_VERSION: u8 = 1;
    pub const FLAG_OVERFLOW: u8 = 1 << 0;

    fn new_empty(page_size: u16, slots_per_page: u16) -> Self {
        let special_size = (slots_per_page as usize) * TransactionSlot::SIZE;
        let special_start = page_size - special_size as u16;
        Self {
            version: Self::CURRENT_VERSION,
            flags: 0,
            prune_xid_hint: 0,
            lsn: 0,
            line_pointer_count: 0,
            free_start: Self::SIZE as u16,
            free_end: special_start,
            special_start,
        }
    }

    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        self.flags & Self::FLAG_OVERFLOW != 0
    }

    fn encode(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for page header".into()));
        }
        let mut cursor = Cursor::new(buf);
        cursor.write_u8(self.version).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u8(self.flags).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor
            .write_u32::<LittleEndian>(self.prune_xid_hint)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u64::<LittleEndian>(self.lsn).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor
            .write_u16::<LittleEndian>(self.line_pointer_count)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u16::<LittleEndian>(self.free_start).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor.write_u16::<LittleEndian>(self.free_end).map_err(|e| StorageError::Codec(e.to_string()))?;
        cursor
            .write_u16::<LittleEndian>(self.special_start)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StorageError::Codec("buffer too small for page header".into()));
        }
        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let flags = cursor.read_u8().map_err(|e| StorageError::Codec(e.to_string()))?;
        let prune_xid_hint =
            cursor.read_u32::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let lsn = cursor.read_u64::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let line_pointer_count =
            cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let free_start = cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let free_end = cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        let special_start =
            cursor.read_u16::<LittleEndian>().map_err(|e| StorageError::Codec(e.to_string()))?;
        if version != Self::CURRENT_VERSION {
            return Err(StorageError::Corruption(format!("unsupported page layout version {version}")));
        }
        Ok(Self { version, flags, prune_xid_hint, lsn, line_pointer_count, free_start, free_end, special_start })
    }
}

/// One fixed-size page buffer: header, line pointers, tuple region, and
/// the transaction-slot special area, all backed by a single byte vector.
#[derive(Debug, Clone)]
pub struct Page {
    pub data: Vec<u8>,
    slots_per_page: u16,
}

impl Page {
    #[must_use]
    pub fn new(page_size: usize, slots_per_page: u16) -> Self {
        let mut data = vec![0u8; page_size];
        let header = PageHeader::new_empty(page_size as u16, slots_per_page);
        header.encode(&mut data).expect("fresh page buffer is large enough for its own header");
        for i in 0..slots_per_page {
            let slot = if i == 0 { TransactionSlot::FROZEN } else { TransactionSlot { xid: crate::types::Xid::INVALID, undo_ptr: crate::types::UndoPtr::NONE } };
            let start = header.special_start as usize + i as usize * TransactionSlot::SIZE;
            slot.encode(&mut data[start..start + TransactionSlot::SIZE])
                .expect("fresh page buffer has room for every slot");
        }
        Self { data, slots_per_page }
    }

    pub fn from_bytes(data: Vec<u8>, slots_per_page: u16) -> Result<Self> {
        PageHeader::decode(&data)?;
        Ok(Self { data, slots_per_page })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn header(&self) -> PageHeader {
        PageHeader::decode(&self.data).expect("page buffer was validated at construction")
    }

    pub fn set_header(&mut self, header: PageHeader) -> Result<()> {
        header.encode(&mut self.data)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        let mut header = self.header();
        header.lsn = lsn;
        self.set_header(header).expect("header buffer unchanged in size");
    }

    fn line_pointer_slice(&self, idx: u16) -> std::ops::Range<usize> {
        let start = PageHeader::SIZE + idx as usize * LinePointer::SIZE;
        start..start + LinePointer::SIZE
    }

    pub fn line_pointer(&self, idx: u16) -> Result<LinePointer> {
        let header = self.header();
        if idx >= header.line_pointer_count {
            return Err(StorageError::NotFound(format!("line pointer {idx} out of range")));
        }
        let range = self.line_pointer_slice(idx);
        LinePointer::decode(&self.data[range])
    }

    pub fn set_line_pointer(&mut self, idx: u16, lp: LinePointer) -> Result<()> {
        let range = self.line_pointer_slice(idx);
        lp.encode(&mut self.data[range])
    }

    pub fn line_pointer_count(&self) -> u16 {
        self.header().line_pointer_count
    }

    pub fn slot(&self, idx: crate::types::SlotIndex) -> Result<TransactionSlot> {
        if idx.0 >= self.slots_per_page {
            return Err(StorageError::NotFound(format!("slot {} out of range", idx.0)));
        }
        let header = self.header();
        let start = header.special_start as usize + idx.0 as usize * TransactionSlot::SIZE;
        TransactionSlot::decode(&self.data[start..start + TransactionSlot::SIZE])
    }

    pub fn set_slot(&mut self, idx: crate::types::SlotIndex, slot: TransactionSlot) -> Result<()> {
        if idx.0 >= self.slots_per_page {
            return Err(StorageError::NotFound(format!("slot {} out of range", idx.0)));
        }
        let header = self.header();
        let start = header.special_start as usize + idx.0 as usize * TransactionSlot::SIZE;
        slot.encode(&mut self.data[start..start + TransactionSlot::SIZE])
    }

    pub fn slots(&self) -> Result<Vec<TransactionSlot>> {
        (0..self.slots_per_page).map(|i| self.slot(crate::types::SlotIndex(i))).collect()
    }

    /// Bytes still available for a new line pointer plus a tuple of
    /// `payload_len` bytes, accounting for both the upward-growing line
    /// pointer array and the downward-growing tuple region.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let header = self.header();
        (header.free_end as usize).saturating_sub(header.free_start as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_page_has_frozen_slot_zero() {
        let page = Page::new(8192, 4);
        let slot0 = page.slot(crate::types::SlotIndex(0)).unwrap();
        assert_eq!(slot0, TransactionSlot::FROZEN);
        assert_eq!(page.line_pointer_count(), 0);
    }

    #[test]
    fn header_roundtrips_through_bytes() {
        let page = Page::new(8192, 4);
        let reloaded = Page::from_bytes(page.data.clone(), 4).unwrap();
        assert_eq!(reloaded.header(), page.header());
    }

    #[test]
    fn free_space_shrinks_as_special_area_grows() {
        let small = Page::new(8192, 1);
        let large = Page::new(8192, 16);
        assert!(large.free_space() < small.free_space());
    }
}
