#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    deprecated,
    unused
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::too_many_arguments
)]

//! # zheap
//!
//! A transactional, in-place-update table storage engine with a separate
//! undo log, modeled on PostgreSQL's zheap storage format.
//!
//! Where a conventional heap keeps every version of a row inline and relies
//! on periodic vacuuming to reclaim old versions, zheap overwrites a row's
//! tuple in place whenever the new version fits in the old one's reservation
//! and pushes the prior version (or, for deletes and inserts, just enough to
//! undo the operation) onto a separate append-only undo log. A reader whose
//! snapshot predates the change follows the page's transaction slot back
//! into that log instead of scanning multiple copies of the row on the page
//! itself.
//!
//! ## Module map
//!
//! - [`types`]: the small value types shared across every layer (`Xid`,
//!   `Tid`, `UndoPtr`, `Lsn`, `SlotIndex`, `SpeculativeToken`).
//! - [`error`]: the crate's single `Result`/`StorageError` pair.
//! - [`config`]: page size, slot count, and worker tuning knobs.
//! - [`page`]: the on-disk page layout — header, line-pointer array, tuple
//!   headers, and the per-page transaction-slot array.
//! - [`pages`]: a block-indexed page store backing pages with a file.
//! - [`undo`]: the undo log store and the tagged undo record codec.
//! - [`txn`]: transaction id allocation, snapshots, and row-level locking.
//! - [`wal`]: the write-ahead log recording both heap and undo mutations.
//! - [`dml`]: insert/delete/update/lock operations against a single page.
//! - [`visibility`]: resolves what a snapshot can see for a given row.
//! - [`prune`]: reclaims dead line pointers once nothing can see them.
//! - [`rollback`]: undo application, both inline and via the background
//!   [`rollback::worker`].
//! - [`discard`]: advances the undo discard horizon.
//! - [`access`]: [`access::TableAccess`] and [`access::HeapRelation`], which
//!   assemble every other module behind one relation handle.

pub mod access;
pub mod config;
pub mod discard;
pub mod dml;
pub mod error;
pub mod page;
pub mod pages;
pub mod prune;
pub mod rollback;
pub mod txn;
pub mod types;
pub mod undo;
pub mod visibility;
pub mod wal;

pub use access::{HeapRelation, TableAccess};
pub use config::EngineConfig;
pub use error::{Result, StorageError};
pub use types::{Lsn, SlotIndex, SpeculativeToken, Tid, UndoPtr, Xid};
