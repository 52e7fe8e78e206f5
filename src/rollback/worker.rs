//! Background undo worker: a single long-lived thread that drains a retry
//! queue of aborted transactions too large to unwind inline, applying
//! fixed-size undo windows and backing off adaptively when the queue runs
//! dry (spec §4.8, §9).
//!
//! Grounded in the teacher's lock-manager style of a mutex-guarded queue
//! plus a condvar, generalized here to a polling sleep loop since the
//! worker also has to wake on a plain timer (its backoff), not only on a
//! new item arriving.

use crate::config::EngineConfig;
use crate::pages::PageStore;
use crate::rollback::rollback_window;
use crate::txn::TxnManager;
use crate::types::{UndoPtr, Xid};
use crate::undo::manager::UndoManager;
use crate::wal::WalWriter;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

struct Job {
    xid: Xid,
    next: UndoPtr,
    attempts: u32,
}

struct Shared {
    txn: Arc<TxnManager>,
    undo: Arc<UndoManager>,
    pages: Arc<PageStore>,
    wal: Arc<WalWriter>,
    config: EngineConfig,
}

/// Owns the background rollback thread and the queue feeding it.
pub struct UndoWorker {
    queue: Arc<Mutex<VecDeque<Job>>>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<Mutex<bool>>,
}

impl UndoWorker {
    /// Spawns the worker thread. It sleeps at `config.worker_backoff_min_ms`
    /// when the queue is non-empty and doubles its backoff up to
    /// `config.worker_backoff_max_ms` each time it finds nothing to do,
    /// resetting to the minimum as soon as work arrives again.
    #[must_use]
    pub fn spawn(
        txn: Arc<TxnManager>,
        undo: Arc<UndoManager>,
        pages: Arc<PageStore>,
        wal: Arc<WalWriter>,
        config: EngineConfig,
    ) -> Self {
        let queue: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(Mutex::new(false));
        let shared = Shared { txn, undo, pages, wal, config };

        let worker_queue = Arc::clone(&queue);
        let worker_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || Self::run(shared, worker_queue, worker_stop));

        Self { queue, handle: Some(handle), stop }
    }

    /// Hands a large abort off to the background thread instead of
    /// unwinding it on the caller. `xid` must already be marked aborted.
    pub fn enqueue(&self, xid: Xid, from: UndoPtr) {
        let mut queue = self.queue.lock().expect("undo worker queue mutex poisoned");
        queue.push_back(Job { xid, next: from, attempts: 0 });
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("undo worker queue mutex poisoned").len()
    }

    fn run(shared: Shared, queue: Arc<Mutex<VecDeque<Job>>>, stop: Arc<Mutex<bool>>) {
        let mut backoff = Duration::from_millis(shared.config.worker_backoff_min_ms);
        let max_backoff = Duration::from_millis(shared.config.worker_backoff_max_ms);

        loop {
            if *stop.lock().expect("undo worker stop flag poisoned") {
                return;
            }

            let job = queue.lock().expect("undo worker queue mutex poisoned").pop_front();
            let Some(mut job) = job else {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
                continue;
            };
            backoff = Duration::from_millis(shared.config.worker_backoff_min_ms);

            match rollback_window(
                job.xid,
                job.next,
                shared.config.undo_window_bytes,
                &shared.undo,
                &shared.pages,
                &shared.wal,
            ) {
                Ok(resume) if resume.is_none() => {
                    shared.txn.mark_undone(job.xid);
                    info!("background rollback of {} finished after {} window(s)", job.xid, job.attempts + 1);
                }
                Ok(resume) => {
                    job.next = resume;
                    job.attempts += 1;
                    queue.lock().expect("undo worker queue mutex poisoned").push_back(job);
                }
                Err(err) => {
                    warn!("undo window for {} failed, retrying: {err}", job.xid);
                    job.attempts += 1;
                    queue.lock().expect("undo worker queue mutex poisoned").push_back(job);
                }
            }
        }
    }
}

impl Drop for UndoWorker {
    fn drop(&mut self) {
        *self.stop.lock().expect("undo worker stop flag poisoned") = true;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dml::{self, DmlContext};
    use crate::page::{LinePointer, TransactionStatusLookup};
    use crate::txn::LockManager;
    use crate::wal::WalWriter;
    use std::time::Instant;

    #[test]
    fn enqueued_abort_eventually_applies_every_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.worker_backoff_min_ms = 5;
        config.worker_backoff_max_ms = 20;
        config.undo_window_bytes = 1; // force one record per window

        let txn = Arc::new(TxnManager::new());
        let undo = Arc::new(UndoManager::open(dir.path().join("undo")).unwrap());
        let pages = Arc::new(PageStore::open(dir.path().join("table.dat"), config).unwrap());
        let wal = Arc::new(WalWriter::open(dir.path().join("wal.log")).unwrap());
        let locks = LockManager::new();

        let block = pages.allocate().unwrap();
        let xid = txn.begin();
        undo.attach(xid).unwrap();
        for payload in [b"a" as &[u8], b"b", b"c"] {
            pages
                .with_page_mut(block, |page| {
                    let mut ctx = DmlContext { page, block, xid, config: &config, txn: &txn, undo: &undo, wal: &wal };
                    dml::insert(&mut ctx, payload)
                })
                .unwrap();
        }
        txn.abort(xid);
        let start = txn.last_undo(xid);

        let worker =
            UndoWorker::spawn(Arc::clone(&txn), Arc::clone(&undo), Arc::clone(&pages), Arc::clone(&wal), config);
        worker.enqueue(xid, start);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !txn.is_aborted_and_undone(xid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(txn.is_aborted_and_undone(xid));

        let page = pages.read_page(block).unwrap();
        assert_eq!(page.line_pointer(0).unwrap(), LinePointer::Dead);
        assert_eq!(page.line_pointer(1).unwrap(), LinePointer::Dead);
        assert_eq!(page.line_pointer(2).unwrap(), LinePointer::Dead);
    }

    #[test]
    fn idle_worker_queue_stays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default();
        let txn = Arc::new(TxnManager::new());
        let undo = Arc::new(UndoManager::open(dir.path().join("undo")).unwrap());
        let pages = Arc::new(PageStore::open(dir.path().join("table.dat"), config).unwrap());
        let wal = Arc::new(WalWriter::open(dir.path().join("wal.log")).unwrap());
        let worker = UndoWorker::spawn(txn, undo, pages, wal, config);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(worker.queue_len(), 0);
    }
}
