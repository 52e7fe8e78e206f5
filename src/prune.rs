//! Opportunistic page pruning: reclaims the tuple-region bytes of rows
//! nobody can reach anymore, without renumbering any surviving line
//! pointer (spec §4.7).

use crate::error::Result;
use crate::page::{HeapPage, LinePointer, Page};
use crate::page::slot::TransactionStatusLookup;
use crate::types::Xid;

/// Prunes `page` in place and returns the number of tuple-region bytes
/// reclaimed. `status` decides whether a deleted row's owning transaction
/// is visible to every possible reader, the only condition under which
/// its line pointer can be freed.
pub fn prune_page(page: &mut Page, status: &dyn TransactionStatusLookup, cutoff: Xid) -> Result<usize> {
    let count = page.line_pointer_count();
    let mut reclaimable = Vec::new();
    for idx in 0..count {
        match page.line_pointer(idx)? {
            LinePointer::Dead => reclaimable.push(idx),
            LinePointer::Deleted { slot_index } => {
                let slot = page.slot(slot_index)?;
                if status.is_committed_all_visible(slot.xid) {
                    reclaimable.push(idx);
                }
            }
            LinePointer::Normal { .. } | LinePointer::Unused => {}
        }
    }

    if reclaimable.is_empty() {
        return Ok(0);
    }
    let reclaimed = HeapPage::compact(page, &reclaimable)?;

    let mut header = page.header();
    header.prune_xid_hint = cutoff.counter();
    page.set_header(header)?;
    Ok(reclaimed)
}

/// Whether `page` looks worth pruning: it holds at least one `Dead` or
/// `Deleted` line pointer. Cheap enough to call before acquiring whatever
/// lock a real prune pass would need.
#[must_use]
pub fn needs_prune(page: &Page) -> bool {
    let count = page.line_pointer_count();
    (0..count).any(|idx| matches!(page.line_pointer(idx), Ok(LinePointer::Dead) | Ok(LinePointer::Deleted { .. })))
}
