//! Minimal disk-backed page store: every block lives in a single
//! growable file, seeked to by block number times page size, with an
//! in-memory cache of decoded pages in front of it.
//!
//! Grounded in the teacher's `DiskManager` (seek-then-`write_all`/
//! `read_exact` against one file handle, page ids counted from file
//! length) generalized from a fixed `PAGE_SIZE` constant to this engine's
//! configurable page size. Deliberately not a full LRU/clock buffer pool
//! (out of scope): every block that has ever been touched stays cached
//! for the life of the store.

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::page::Page;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

struct Inner {
    file: File,
    cache: HashMap<u32, Page>,
    next_block: u32,
}

/// Owns the on-disk file backing one table's pages.
pub struct PageStore {
    config: EngineConfig,
    inner: Mutex<Inner>,
}

impl PageStore {
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let next_block = (len / config.page_size as u64) as u32;
        Ok(Self { config, inner: Mutex::new(Inner { file, cache: HashMap::new(), next_block }) })
    }

    /// Allocates a fresh, empty block and returns its number.
    pub fn allocate(&self) -> Result<u32> {
        let mut inner = self.inner.lock().expect("page store mutex poisoned");
        let block = inner.next_block;
        inner.next_block += 1;
        let page = Page::new(self.config.page_size, self.config.slots_per_page);
        self.write_locked(&mut inner, block, &page)?;
        inner.cache.insert(block, page);
        Ok(block)
    }

    /// Runs `f` against block `block`'s page, persisting any mutation it
    /// makes. Reads the block from disk into the cache first if this is
    /// its first touch this session.
    pub fn with_page_mut<F, T>(&self, block: u32, f: F) -> Result<T>
    where
        F: FnOnce(&mut Page) -> Result<T>,
    {
        let mut inner = self.inner.lock().expect("page store mutex poisoned");
        if !inner.cache.contains_key(&block) {
            let page = self.read_locked(&mut inner, block)?;
            inner.cache.insert(block, page);
        }
        let mut page = inner.cache.remove(&block).expect("just inserted or already present");
        let result = f(&mut page);
        self.write_locked(&mut inner, block, &page)?;
        inner.cache.insert(block, page);
        result
    }

    /// Returns a clone of block `block`'s current page image, for readers
    /// that only need to inspect it (the visibility resolver, pruning
    /// pre-check).
    pub fn read_page(&self, block: u32) -> Result<Page> {
        let mut inner = self.inner.lock().expect("page store mutex poisoned");
        if let Some(page) = inner.cache.get(&block) {
            return Ok(page.clone());
        }
        let page = self.read_locked(&mut inner, block)?;
        inner.cache.insert(block, page.clone());
        Ok(page)
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.inner.lock().expect("page store mutex poisoned").next_block
    }

    fn read_locked(&self, inner: &mut Inner, block: u32) -> Result<Page> {
        if block >= inner.next_block {
            return Err(StorageError::NotFound(format!("block {block} has not been allocated")));
        }
        let offset = block as u64 * self.config.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.config.page_size];
        inner.file.read_exact(&mut buf)?;
        Page::from_bytes(buf, self.config.slots_per_page)
    }

    fn write_locked(&self, inner: &mut Inner, block: u32, page: &Page) -> Result<()> {
        let offset = block as u64 * self.config.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&page.data)?;
        inner.file.flush()?;
        Ok(())
    }
}
