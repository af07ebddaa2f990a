// Tuple visibility.
//
// MVCC evaluation of a tuple's xmin/xmax against a snapshot, with hint
// bit maintenance: once a transaction's fate is known the outcome is
// stamped into the infomask so later visitors skip the status lookup.
// Callers persist changed hints with `set_commit_info_needs_save`,
// which marks the page dirty without forcing a pre-commit flush.

use crate::common::{TransactionId, XidStatus};
use crate::db::Database;
use crate::env::Env;
use crate::error::Result;
use crate::heap::tuple::{
    tuple_get_cmax, tuple_get_cmin, tuple_get_infomask, tuple_get_xmax, tuple_get_xmin,
    tuple_set_infomask, HEAP_MARKED_FOR_UPDATE, HEAP_XMAX_COMMITTED, HEAP_XMAX_INVALID,
    HEAP_XMIN_COMMITTED, HEAP_XMIN_INVALID,
};
use crate::transaction::snapshot::{Snap, Snapshot};

/// Classification used by vacuum and the fast index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumStatus {
    /// Inserter aborted; the tuple never existed.
    Stillborn,
    /// Deleted and committed, but a running transaction may still see it.
    RecentlyDead,
    /// Deleted, committed, invisible to everyone.
    Dead,
    Live,
    InsertInProgress,
    DeleteInProgress,
}

impl VacuumStatus {
    /// Does the fast index build route this tuple to the dead spool?
    pub fn routes_dead(self) -> bool {
        matches!(
            self,
            VacuumStatus::Stillborn
                | VacuumStatus::RecentlyDead
                | VacuumStatus::Dead
                | VacuumStatus::InsertInProgress
        )
    }
}

/// Evaluate visibility under a visibility contract. Returns
/// `(visible, hints_changed)`.
pub fn tuple_satisfies(
    db: &Database,
    env: &mut Env,
    tup: &mut [u8],
    snap: &Snap<'_>,
) -> Result<(bool, bool)> {
    match snap {
        Snap::Any => Ok((true, false)),
        Snap::Mvcc(snapshot) => tuple_satisfies_snapshot(db, env, tup, snapshot),
    }
}

pub fn tuple_satisfies_snapshot(
    db: &Database,
    env: &mut Env,
    tup: &mut [u8],
    snap: &Snapshot,
) -> Result<(bool, bool)> {
    let mut changed = false;
    let mut mask = tuple_get_infomask(tup);
    let xmin = tuple_get_xmin(tup);

    if mask & HEAP_XMIN_COMMITTED == 0 {
        if mask & HEAP_XMIN_INVALID != 0 {
            return Ok((false, changed));
        }
        if xmin == snap.self_xid {
            if tuple_get_cmin(tup) >= snap.cmdid {
                // inserted by a later command of our own transaction
                return Ok((false, changed));
            }
        } else {
            match db.xid_status(env, xmin)? {
                XidStatus::InProgress => return Ok((false, changed)),
                XidStatus::Abort => {
                    mask |= HEAP_XMIN_INVALID;
                    tuple_set_infomask(tup, mask);
                    return Ok((false, true));
                }
                st if st.is_committed() => {
                    mask |= HEAP_XMIN_COMMITTED;
                    tuple_set_infomask(tup, mask);
                    changed = true;
                }
                _ => unreachable!(),
            }
        }
    }

    // the inserter committed; is that commit inside our snapshot?
    if xmin != snap.self_xid && snap.is_running(xmin) {
        return Ok((false, changed));
    }

    // deletion side
    if mask & HEAP_XMAX_INVALID != 0 {
        return Ok((true, changed));
    }
    let xmax = tuple_get_xmax(tup);
    if xmax == 0 {
        return Ok((true, changed));
    }
    if mask & HEAP_MARKED_FOR_UPDATE != 0 {
        // locked for update, not deleted
        return Ok((true, changed));
    }

    if mask & HEAP_XMAX_COMMITTED == 0 {
        if xmax == snap.self_xid {
            // our own deletion is visible from the next command on
            return Ok((tuple_get_cmax(tup) >= snap.cmdid, changed));
        }
        match db.xid_status(env, xmax)? {
            XidStatus::InProgress => return Ok((true, changed)),
            XidStatus::Abort => {
                mask |= HEAP_XMAX_INVALID;
                tuple_set_infomask(tup, mask);
                return Ok((true, true));
            }
            st if st.is_committed() => {
                mask |= HEAP_XMAX_COMMITTED;
                tuple_set_infomask(tup, mask);
                changed = true;
            }
            _ => unreachable!(),
        }
    }

    // deleter committed; invisible only if that commit is inside the
    // snapshot
    if xmax != snap.self_xid && snap.is_running(xmax) {
        return Ok((true, changed));
    }
    Ok((false, changed))
}

/// Classify a tuple for vacuum / index build. `oldest` is the lowest
/// xid any running transaction could still care about.
pub fn tuple_satisfies_vacuum(
    db: &Database,
    env: &mut Env,
    tup: &[u8],
    current_xid: TransactionId,
    oldest: TransactionId,
) -> Result<VacuumStatus> {
    let mask = tuple_get_infomask(tup);
    let xmin = tuple_get_xmin(tup);

    if mask & HEAP_XMIN_COMMITTED == 0 {
        if mask & HEAP_XMIN_INVALID != 0 {
            return Ok(VacuumStatus::Stillborn);
        }
        if xmin == current_xid {
            return Ok(VacuumStatus::InsertInProgress);
        }
        match db.xid_status(env, xmin)? {
            XidStatus::InProgress => return Ok(VacuumStatus::InsertInProgress),
            XidStatus::Abort => return Ok(VacuumStatus::Stillborn),
            _ => {}
        }
    }

    if mask & HEAP_XMAX_INVALID != 0 || tuple_get_xmax(tup) == 0 {
        return Ok(VacuumStatus::Live);
    }
    if mask & HEAP_MARKED_FOR_UPDATE != 0 {
        return Ok(VacuumStatus::Live);
    }
    let xmax = tuple_get_xmax(tup);
    if mask & HEAP_XMAX_COMMITTED == 0 {
        if xmax == current_xid {
            return Ok(VacuumStatus::DeleteInProgress);
        }
        match db.xid_status(env, xmax)? {
            XidStatus::InProgress => return Ok(VacuumStatus::DeleteInProgress),
            XidStatus::Abort => return Ok(VacuumStatus::Live),
            _ => {}
        }
    }
    if xmax >= oldest {
        Ok(VacuumStatus::RecentlyDead)
    } else {
        Ok(VacuumStatus::Dead)
    }
}
