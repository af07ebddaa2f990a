// MVCC snapshots.
//
// A snapshot freezes the set of transactions that were in progress at
// the moment it was taken. Two tasks holding the same snapshot see
// identical results; the snapshot-taker's own uncommitted work remains
// visible through the self xid / command id fields.

use crate::common::{CommandId, TransactionId};

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Every xid below this was finished when the snapshot was taken.
    pub xmin: TransactionId,
    /// Every xid at or above this had not started.
    pub xmax: TransactionId,
    /// In-progress xids in `[xmin, xmax)`, sorted.
    pub xip: Vec<TransactionId>,
    /// The snapshot owner.
    pub self_xid: TransactionId,
    /// Commands below this within the owning transaction are visible.
    pub cmdid: CommandId,
}

impl Snapshot {
    pub fn new(
        running: Vec<TransactionId>,
        next_xid: TransactionId,
        self_xid: TransactionId,
        cmdid: CommandId,
    ) -> Snapshot {
        let xmin = running
            .iter()
            .copied()
            .filter(|&x| x != self_xid)
            .min()
            .unwrap_or(next_xid);
        Snapshot {
            xmin,
            xmax: next_xid,
            xip: running,
            self_xid,
            cmdid,
        }
    }

    /// Was `xid` still in progress when this snapshot was taken?
    #[inline]
    pub fn is_running(&self, xid: TransactionId) -> bool {
        if xid >= self.xmax {
            return true;
        }
        if xid < self.xmin {
            return false;
        }
        self.xip.binary_search(&xid).is_ok()
    }
}

/// Visibility contract handed to the access methods.
#[derive(Debug, Clone)]
pub enum Snap<'a> {
    /// Every tuple, committed or not. Used by index builds.
    Any,
    /// Normal MVCC visibility against a snapshot.
    Mvcc(&'a Snapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_set_membership() {
        let s = Snapshot::new(vec![5, 9], 12, 9, 1);
        assert_eq!(s.xmin, 5);
        assert!(s.is_running(5));
        assert!(s.is_running(9));
        assert!(!s.is_running(4));
        assert!(!s.is_running(7));
        // future xids are always "running"
        assert!(s.is_running(12));
        assert!(s.is_running(100));
    }

    #[test]
    fn empty_running_set() {
        let s = Snapshot::new(vec![], 8, 7, 1);
        assert_eq!(s.xmin, 8);
        assert!(!s.is_running(7));
        assert!(s.is_running(8));
    }
}
