//! Undo log: the append-only record store that lets an in-place update be
//! rolled back and that backs MVCC visibility for versions no longer
//! present on the page itself (spec §4.1, §4.2).

pub mod log;
pub mod manager;
pub mod record;

pub use log::UndoLog;
pub use manager::UndoManager;
pub use record::{UndoRecord, UndoRecordBody};
