//! Engine-wide tunables.
//!
//! Collected in one place the way the teacher collects WAL-writer policy in
//! `WalWriterConfig`: a plain `Copy` struct with a `Default` impl, built
//! programmatically rather than parsed from a file (config file parsing is
//! out of scope here).

/// Tunable parameters for one storage engine instance.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Page size in bytes. Spec default is 8192.
    pub page_size: usize,
    /// Number of in-special-area transaction slots per page before
    /// overflow pages are consulted. Spec default is 4.
    pub slots_per_page: u16,
    /// Size of one rollback-application window, in bytes of undo.
    pub undo_window_bytes: u64,
    /// Undo byte threshold below which rollback runs in the foreground
    /// instead of being handed to the background worker.
    pub foreground_rollback_threshold_bytes: u64,
    /// Minimum worker hibernation backoff.
    pub worker_backoff_min_ms: u64,
    /// Maximum worker hibernation backoff.
    pub worker_backoff_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 8192,
            slots_per_page: 4,
            undo_window_bytes: 32 * 1024 * 1024,
            foreground_rollback_threshold_bytes: 4096,
            worker_backoff_min_ms: 100,
            worker_backoff_max_ms: 10_000,
        }
    }
}
