//! On-disk undo log segment: one append-only file per log number.
//!
//! Mirrors the teacher's `DiskManager` approach of seeking to a computed
//! byte offset and issuing `write_all`/`read_exact` against a single file
//! handle, but keyed by undo log number instead of page id.

use crate::error::{Result, StorageError};
use crate::types::{UndoPtr, Xid};
use crate::undo::record::UndoRecord;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One writer's append-only undo segment.
pub struct UndoLog {
    log_number: u32,
    path: PathBuf,
    file: File,
    /// Byte offset the next record will be written at; also the current
    /// logical length of the log.
    tail: u64,
    /// Bytes below this offset have been discarded and must not be read.
    discard_offset: u64,
    /// The single transaction currently allowed to append, per the
    /// one-writer-per-log discipline (spec §4.2).
    attached_xid: Option<Xid>,
}

impl UndoLog {
    /// Opens (creating if absent) the segment file for `log_number` under
    /// `dir`.
    pub fn open(dir: &Path, log_number: u32) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("undo.{log_number}.seg"));
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let tail = file.metadata()?.len();
        Ok(Self { log_number, path, file, tail, discard_offset: 0, attached_xid: None })
    }

    #[must_use]
    pub fn log_number(&self) -> u32 {
        self.log_number
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached_xid.is_some()
    }

    #[must_use]
    pub fn attached_xid(&self) -> Option<Xid> {
        self.attached_xid
    }

    /// Claims this log for exclusive use by `xid`. Fails if another
    /// transaction already holds it; `UndoManager` is expected to pick a
    /// different log rather than block on this.
    pub fn attach(&mut self, xid: Xid) -> Result<()> {
        match self.attached_xid {
            Some(owner) if owner != xid => {
                Err(StorageError::InvalidInput(format!("undo log {} already attached to {owner}", self.log_number)))
            }
            _ => {
                self.attached_xid = Some(xid);
                Ok(())
            }
        }
    }

    pub fn detach(&mut self) {
        self.attached_xid = None;
    }

    /// Appends `record` at the current tail and returns its address.
    /// Caller must hold the attach for `record.xid`.
    pub fn append(&mut self, record: &UndoRecord) -> Result<UndoPtr> {
        if self.attached_xid != Some(record.xid) {
            return Err(StorageError::InvalidInput(format!(
                "xid {} attempted to append to undo log {} not attached to it",
                record.xid, self.log_number
            )));
        }
        let bytes = record.encode()?;
        self.file.seek(SeekFrom::Start(self.tail))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        let ptr = UndoPtr::new(self.log_number, self.tail);
        self.tail += bytes.len() as u64;
        Ok(ptr)
    }

    /// Reads the record beginning at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<UndoRecord> {
        if offset < self.discard_offset {
            return Err(StorageError::UndoUnavailable(format!(
                "offset {offset} in log {} lies below discard horizon {}",
                self.log_number, self.discard_offset
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let total_len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; total_len];
        buf[0..4].copy_from_slice(&len_buf);
        self.file.read_exact(&mut buf[4..])?;
        UndoRecord::decode(&buf)
    }

    /// Reads the record whose frame *ends* at `end_offset`, used to walk a
    /// transaction's or page's undo chain backwards via `prev`/`blkprev`
    /// without maintaining a separate reverse index.
    pub fn read_ending_at(&mut self, end_offset: u64) -> Result<UndoRecord> {
        if end_offset < 4 || end_offset > self.tail {
            return Err(StorageError::Corruption(format!("invalid undo record end offset {end_offset}")));
        }
        self.file.seek(SeekFrom::Start(end_offset - 4))?;
        let mut trailer_buf = [0u8; 4];
        self.file.read_exact(&mut trailer_buf)?;
        let total_len = u32::from_le_bytes(trailer_buf) as u64;
        if total_len > end_offset {
            return Err(StorageError::Corruption("undo record trailer length exceeds log position".into()));
        }
        self.read_at(end_offset - total_len)
    }

    /// Logically advances the discard horizon; bytes below `offset`
    /// become unreadable. Does not reclaim disk space, mirroring the
    /// spec's choice to model discard as a horizon rather than physical
    /// truncation.
    pub fn discard_up_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.tail {
            return Err(StorageError::InvalidInput("cannot discard past the log tail".into()));
        }
        if offset > self.discard_offset {
            self.discard_offset = offset;
        }
        Ok(())
    }

    #[must_use]
    pub fn discard_offset(&self) -> u64 {
        self.discard_offset
    }

    #[must_use]
    pub fn tail(&self) -> u64 {
        self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tid;
    use crate::undo::record::UndoRecordBody;

    fn rec(xid: Xid) -> UndoRecord {
        UndoRecord { xid, tid: Tid::new(1, 1), prev: UndoPtr::NONE, blkprev: UndoPtr::NONE, body: UndoRecordBody::Insert }
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = UndoLog::open(dir.path(), 0).unwrap();
        let xid = Xid::new(0, 1);
        log.attach(xid).unwrap();
        let ptr = log.append(&rec(xid)).unwrap();
        let read = log.read_at(ptr.offset()).unwrap();
        assert_eq!(read, rec(xid));
    }

    #[test]
    fn second_attach_by_other_xid_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = UndoLog::open(dir.path(), 0).unwrap();
        log.attach(Xid::new(0, 1)).unwrap();
        assert!(log.attach(Xid::new(0, 2)).is_err());
    }

    #[test]
    fn read_ending_at_matches_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = UndoLog::open(dir.path(), 0).unwrap();
        let xid = Xid::new(0, 1);
        log.attach(xid).unwrap();
        let ptr = log.append(&rec(xid)).unwrap();
        let end = log.tail();
        let by_start = log.read_at(ptr.offset()).unwrap();
        let by_end = log.read_ending_at(end).unwrap();
        assert_eq!(by_start, by_end);
    }

    #[test]
    fn discard_horizon_blocks_old_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = UndoLog::open(dir.path(), 0).unwrap();
        let xid = Xid::new(0, 1);
        log.attach(xid).unwrap();
        let ptr = log.append(&rec(xid)).unwrap();
        log.discard_up_to(log.tail()).unwrap();
        assert!(matches!(log.read_at(ptr.offset()), Err(StorageError::UndoUnavailable(_))));
    }
}
