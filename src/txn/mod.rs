//! Transaction lifecycle, snapshots, and row-level locking (spec §4.6,
//! §5).

pub mod lock_manager;
pub mod manager;
pub mod snapshot;

pub use lock_manager::{LockManager, LockMode, WaitPolicy};
pub use manager::{TxnManager, TxnState};
pub use snapshot::Snapshot;
