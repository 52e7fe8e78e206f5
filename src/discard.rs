//! Discard horizon: bounds how far back undo must be retained, so logs
//! don't grow forever once no reader or rollback could possibly need their
//! oldest records (spec §4.9).
//!
//! The distilled spec walks each log using a forward transaction-header
//! link; this crate doesn't maintain that per-log chain (see DESIGN.md),
//! so it walks the log's own record frames directly from the current
//! discard offset instead — each record already carries the `Xid` that
//! wrote it, which is all the walk needs to decide whether it's safe to
//! retire.

use crate::error::Result;
use crate::page::TransactionStatusLookup;
use crate::txn::TxnManager;
use crate::types::UndoPtr;
use crate::undo::manager::UndoManager;
use crate::undo::record::UndoRecordBody;
use crate::wal::{WalRecord, WalWriter};
use log::debug;

/// Advances the discard horizon of every log as far as currently safe,
/// returning `(log_number, new_discard_offset)` for each log that moved.
///
/// A record is safe to discard once its writer's xid is older than every
/// present or future snapshot (`global_xmin`), or — for transactions that
/// aborted — once the rollback engine has finished undoing them. A
/// slot-reuse record is held back until `global_xmin` passes its xid even
/// if its transaction already finished undoing, since a lagging reader's
/// visibility walk may still dereference it to reach the slot's prior
/// occupant.
pub fn advance(txn: &TxnManager, undo: &UndoManager, wal: &WalWriter) -> Result<Vec<(u32, u64)>> {
    let global_xmin = txn.oldest_active_xid();
    let mut advanced = Vec::new();

    for (log_number, discard_offset, tail) in undo.log_positions() {
        let mut offset = discard_offset;
        while offset < tail {
            let record = match undo.fetch(UndoPtr::new(log_number, offset)) {
                Ok(record) => record,
                Err(_) => break, // torn or not-yet-flushed tail; stop here
            };

            let is_slot_reuse = matches!(record.body, UndoRecordBody::SlotReuse { .. });
            let safe = !record.xid.is_valid()
                || record.xid < global_xmin
                || (!is_slot_reuse && txn.is_aborted_and_undone(record.xid));
            if !safe {
                break;
            }

            let frame_len = record.encode()?.len() as u64;
            offset += frame_len;
        }

        if offset > discard_offset {
            undo.discard_log_up_to(log_number, offset)?;
            wal.append(&WalRecord::ZheapDiscard { log_number, discard_offset: offset })?;
            debug!("advanced discard horizon of log {log_number} from {discard_offset} to {offset}");
            advanced.push((log_number, offset));
        }
    }

    Ok(advanced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dml::{self, DmlContext};
    use crate::page::Page;

    struct Harness {
        _dir: tempfile::TempDir,
        config: EngineConfig,
        txn: TxnManager,
        undo: UndoManager,
        wal: WalWriter,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let undo = UndoManager::open(dir.path().join("undo")).unwrap();
            let wal = WalWriter::open(dir.path().join("wal.log")).unwrap();
            Self { _dir: dir, config: EngineConfig::default(), txn: TxnManager::new(), undo, wal }
        }
    }

    #[test]
    fn commits_below_global_xmin_are_discarded() {
        let h = Harness::new();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);

        // `blocker` starts first so its xid is older than `old`'s; as long
        // as it stays active, global_xmin can't pass `old`'s undo.
        let blocker = h.txn.begin();

        let old = h.txn.begin();
        h.undo.attach(old).unwrap();
        {
            let mut ctx = DmlContext { page: &mut page, block: 0, xid: old, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            dml::insert(&mut ctx, b"row").unwrap();
        }
        h.txn.commit(old);
        h.undo.detach(old);

        let advanced = advance(&h.txn, &h.undo, &h.wal).unwrap();
        assert!(advanced.is_empty());

        h.txn.commit(blocker);
        let advanced = advance(&h.txn, &h.undo, &h.wal).unwrap();
        assert_eq!(advanced.len(), 1);
        assert!(advanced[0].1 > 0);
    }

    #[test]
    fn aborted_and_undone_transaction_is_discardable_before_global_xmin_passes_it() {
        let h = Harness::new();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);

        // `blocker` is older than `writer` and stays active, so global_xmin
        // never passes `writer`'s xid; discard must rely on the
        // aborted-and-undone status instead of age alone.
        let blocker = h.txn.begin();

        let writer = h.txn.begin();
        h.undo.attach(writer).unwrap();
        {
            let mut ctx = DmlContext { page: &mut page, block: 0, xid: writer, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            dml::insert(&mut ctx, b"row").unwrap();
        }
        h.txn.abort(writer);
        h.txn.mark_undone(writer);

        let advanced = advance(&h.txn, &h.undo, &h.wal).unwrap();
        assert_eq!(advanced.len(), 1);

        h.txn.commit(blocker);
    }

    #[test]
    fn slot_reuse_undo_waits_for_global_xmin_even_once_undone() {
        let h = Harness::new();
        let mut page = Page::new(h.config.page_size, h.config.slots_per_page);

        let blocker = h.txn.begin();

        // Occupy every reusable slot (slot 0 is the frozen sentinel) with a
        // transaction that committed after `blocker` started, so each is
        // "committed but not all visible" and reusing its slot costs a
        // slot-reuse undo record.
        for _ in 1..h.config.slots_per_page {
            let occupant = h.txn.begin();
            h.undo.attach(occupant).unwrap();
            {
                let mut ctx =
                    DmlContext { page: &mut page, block: 0, xid: occupant, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
                dml::insert(&mut ctx, b"row").unwrap();
            }
            h.txn.commit(occupant);
            h.undo.detach(occupant);
        }

        let writer = h.txn.begin();
        h.undo.attach(writer).unwrap();
        {
            let mut ctx = DmlContext { page: &mut page, block: 0, xid: writer, config: &h.config, txn: &h.txn, undo: &h.undo, wal: &h.wal };
            // Every slot is taken, so this forces a slot-reuse undo record.
            dml::insert(&mut ctx, b"row").unwrap();
        }
        h.txn.abort(writer);
        h.txn.mark_undone(writer);

        let advanced = advance(&h.txn, &h.undo, &h.wal).unwrap();
        assert!(advanced.is_empty(), "slot-reuse undo must wait for global_xmin, not just mark_undone");

        h.txn.commit(blocker);
        let advanced = advance(&h.txn, &h.undo, &h.wal).unwrap();
        assert!(!advanced.is_empty(), "everything becomes discardable once global_xmin passes every xid involved");
    }
}
