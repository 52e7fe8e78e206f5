//! MVCC snapshots: a cheap, immutable view of which transactions were
//! already committed when the snapshot was taken.

use crate::types::Xid;

/// A point-in-time view of transaction visibility, modeled after the
/// classic xmin/xmax/active-list snapshot: anything below `xmin` is
/// definitely visible, anything at or above `xmax` is definitely not, and
/// anything in between is visible unless it's named in `active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Lowest xid that was still in progress when the snapshot was taken;
    /// every committed xid below this is visible.
    pub xmin: Xid,
    /// One past the highest xid assigned when the snapshot was taken;
    /// nothing at or above this existed yet.
    pub xmax: Xid,
    /// Xids in `[xmin, xmax)` that were in progress (not yet committed or
    /// aborted) at snapshot time.
    pub active: Vec<Xid>,
}

impl Snapshot {
    /// Whether `xid`'s writes are visible under this snapshot, given that
    /// `xid` is known to have committed. Committed-ness is resolved by the
    /// caller (the transaction manager's commit log); this only encodes
    /// the xmin/xmax/active-list arithmetic.
    #[must_use]
    pub fn can_see_committed(&self, xid: Xid) -> bool {
        if xid < self.xmin {
            return true;
        }
        if xid >= self.xmax {
            return false;
        }
        !self.active.contains(&xid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_xmin_is_visible() {
        let snap = Snapshot { xmin: Xid::new(0, 10), xmax: Xid::new(0, 20), active: vec![] };
        assert!(snap.can_see_committed(Xid::new(0, 5)));
    }

    #[test]
    fn at_or_above_xmax_is_not_visible() {
        let snap = Snapshot { xmin: Xid::new(0, 10), xmax: Xid::new(0, 20), active: vec![] };
        assert!(!snap.can_see_committed(Xid::new(0, 20)));
        assert!(!snap.can_see_committed(Xid::new(0, 25)));
    }

    #[test]
    fn in_range_but_active_is_not_visible() {
        let snap = Snapshot { xmin: Xid::new(0, 10), xmax: Xid::new(0, 20), active: vec![Xid::new(0, 15)] };
        assert!(!snap.can_see_committed(Xid::new(0, 15)));
        assert!(snap.can_see_committed(Xid::new(0, 16)));
    }
}
