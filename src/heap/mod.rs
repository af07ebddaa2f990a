// Heap access method.
//
// Scan cursors, single-tuple fetch, insert, delete and update over
// slotted heap pages. Scan keys are tested before visibility: a key
// mismatch is cheaper to establish than a snapshot verdict. Locks are
// dropped between getnext calls; the cursor keeps its pin so the frame
// cannot be replaced or reef-exclusively claimed underneath it.

pub mod tuple;
pub mod visibility;

use std::sync::Arc;
use tracing::debug;

use crate::buffer::LockMode;
use crate::common::{
    BlockNumber, FrameId, ItemPointer, OffsetNumber, ScanKey, Datum, XidStatus, P_NEW,
};
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::heap::tuple::{
    heap_form_tuple, heap_key_test, tuple_get_infomask, tuple_get_xmax, tuple_set_cmax,
    tuple_set_ctid, tuple_set_infomask, tuple_set_xmax, tuple_stamp_insert, HeapTuple,
    HEAP_MARKED_FOR_UPDATE, HEAP_XMAX_COMMITTED, HEAP_XMAX_INVALID,
};
use crate::relation::Relation;
use crate::storage::page::{
    page_free_space, page_item_id, page_max_offset, maxalign,
};
use crate::transaction::snapshot::{Snap, Snapshot};

/// Status codes for delete / update; conflicts are results, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapResult {
    Ok,
    /// Already modified by the current transaction.
    SelfUpdated,
    /// Modified by a committed concurrent transaction.
    ConcurrentlyUpdated,
}

pub struct HeapScan {
    pub rel: Arc<Relation>,
    snapshot: Option<Snapshot>,
    keys: Vec<ScanKey>,
    nblocks: BlockNumber,
    block: BlockNumber,
    offnum: OffsetNumber,
    buf: Option<FrameId>,
    marked: Option<(BlockNumber, OffsetNumber)>,
    done: bool,
}

impl HeapScan {
    pub fn is_done(&self) -> bool {
        self.done
    }
}

pub fn heap_beginscan(
    db: &Database,
    _env: &mut Env,
    rel: Arc<Relation>,
    snap: Snap<'_>,
    keys: Vec<ScanKey>,
) -> Result<HeapScan> {
    let _ = db;
    let nblocks = rel.nblocks()?;
    Ok(HeapScan {
        rel,
        snapshot: match snap {
            Snap::Any => None,
            Snap::Mvcc(s) => Some(s.clone()),
        },
        keys,
        nblocks,
        block: 0,
        offnum: 0,
        buf: None,
        marked: None,
        done: false,
    })
}

/// Advance the cursor and return the next visible tuple.
pub fn heap_getnext(db: &Database, env: &mut Env, scan: &mut HeapScan) -> Result<Option<HeapTuple>> {
    if scan.done {
        return Ok(None);
    }
    loop {
        env.check_for_cancel()?;

        let buf = match scan.buf {
            Some(buf) => buf,
            None => {
                if scan.block >= scan.nblocks {
                    scan.done = true;
                    return Ok(None);
                }
                match db.read_buffer(env, &scan.rel, scan.block) {
                    Ok(buf) => {
                        scan.buf = Some(buf);
                        scan.offnum = 0;
                        buf
                    }
                    Err(DbError::Corrupted(msg)) => {
                        // a block that fails verification yields no rows
                        tracing::warn!(rel = %scan.rel.name, block = scan.block, %msg, "skipping corrupted block");
                        scan.block += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        db.lock_page(env, buf, LockMode::Share);
        let result = scan_page(db, env, scan, buf);
        db.unlock_page(env, buf);

        match result? {
            Some(tup) => return Ok(Some(tup)),
            None => {
                db.release_buffer(env, buf);
                scan.buf = None;
                scan.block += 1;
            }
        }
    }
}

fn scan_page(
    db: &Database,
    env: &mut Env,
    scan: &mut HeapScan,
    buf: FrameId,
) -> Result<Option<HeapTuple>> {
    let snapshot = scan.snapshot.clone();
    let snap = match &snapshot {
        Some(s) => Snap::Mvcc(s),
        None => Snap::Any,
    };
    let page = db.page_mut(env, buf);
    let maxoff = page_max_offset(page);
    let mut next = scan.offnum + 1;
    while next <= maxoff {
        let lp = page_item_id(page, next);
        if !lp.is_used() {
            next += 1;
            continue;
        }
        let range = lp.off as usize..lp.off as usize + lp.len as usize;
        let tup = &mut page[range];

        if !scan.keys.is_empty() && !heap_key_test(tup, &scan.rel.desc, &scan.keys) {
            next += 1;
            continue;
        }
        let (visible, changed) = visibility::tuple_satisfies(db, env, tup, &snap)?;
        if changed {
            db.set_commit_info_needs_save(env, buf);
        }
        if visible {
            let owned = HeapTuple {
                data: tup.to_vec(),
                self_tid: ItemPointer::new(scan.block, next),
            };
            scan.offnum = next;
            return Ok(Some(owned));
        }
        next += 1;
    }
    Ok(None)
}

pub fn heap_endscan(db: &Database, env: &mut Env, scan: &mut HeapScan) {
    if let Some(buf) = scan.buf.take() {
        db.release_buffer(env, buf);
    }
    scan.done = true;
}

/// Remember the current position for a later restore.
pub fn heap_markpos(scan: &mut HeapScan) {
    scan.marked = Some((scan.block, scan.offnum));
}

pub fn heap_restrpos(db: &Database, env: &mut Env, scan: &mut HeapScan) {
    if let Some((block, offnum)) = scan.marked {
        if let Some(buf) = scan.buf.take() {
            db.release_buffer(env, buf);
        }
        scan.block = block;
        scan.offnum = offnum;
        scan.done = false;
    }
}

/// Fetch one tuple by physical location under a snapshot.
pub fn heap_fetch(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    snap: &Snap<'_>,
    tid: ItemPointer,
) -> Result<Option<HeapTuple>> {
    if !tid.is_valid() || tid.block >= rel.nblocks()? {
        return Ok(None);
    }
    let buf = db.read_buffer(env, rel, tid.block)?;
    db.lock_page(env, buf, LockMode::Share);

    let outcome = (|| -> Result<Option<HeapTuple>> {
        let page = db.page_mut(env, buf);
        if tid.offnum == 0 || tid.offnum > page_max_offset(page) {
            return Ok(None);
        }
        let lp = page_item_id(page, tid.offnum);
        if !lp.is_used() {
            return Ok(None);
        }
        let range = lp.off as usize..lp.off as usize + lp.len as usize;
        let tup = &mut page[range];
        let (visible, changed) = visibility::tuple_satisfies(db, env, tup, snap)?;
        if changed {
            db.set_commit_info_needs_save(env, buf);
        }
        Ok(visible.then(|| HeapTuple {
            data: tup.to_vec(),
            self_tid: tid,
        }))
    })();

    db.unlock_page(env, buf);
    db.release_buffer(env, buf);
    outcome
}

fn guard_writable(env: &Env) -> Result<()> {
    if env.read_only {
        return Err(DbError::InvalidState(
            "sub-connection is read-only".into(),
        ));
    }
    if crate::transaction::is_aborted_block(env) {
        return Err(DbError::Aborted);
    }
    Ok(())
}

/// Insert a tuple; returns its physical location.
pub fn heap_insert(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    values: &[Datum],
    nulls: &[bool],
) -> Result<ItemPointer> {
    guard_writable(env)?;

    let mut tup = heap_form_tuple(&rel.desc, values, nulls);
    let xid = crate::transaction::current_xid(env);
    let cmdid = env.transaction.current.cmdid;
    tuple_stamp_insert(&mut tup, xid, cmdid, ItemPointer::invalid());

    let needed = maxalign(tup.len());
    let nblocks = rel.nblocks()?;

    // try the last block first, extend when it cannot hold the tuple
    let mut target = if nblocks == 0 { P_NEW } else { nblocks - 1 };
    let (buf, block) = loop {
        let buf = db.read_buffer(env, rel, target)?;
        let block = db.block_of(env, buf);
        db.lock_page(env, buf, LockMode::Exclusive);
        if page_free_space(db.page(env, buf)) >= needed {
            break (buf, block);
        }
        db.unlock_page(env, buf);
        db.release_buffer(env, buf);
        if target == P_NEW {
            return Err(DbError::Storage(format!(
                "tuple of {} bytes does not fit on an empty page",
                tup.len()
            )));
        }
        target = P_NEW;
    };

    let page = db.page_mut(env, buf);
    let offnum = page_add_item_checked(page, &tup)?;
    let tid = ItemPointer::new(block, offnum);
    {
        let item = crate::storage::page::page_get_item_mut(page, offnum);
        tuple_set_ctid(item, tid);
    }
    db.unlock_page(env, buf);

    mark_write(env, rel);
    db.write_no_release(env, rel, buf)?;
    db.release_buffer(env, buf);
    debug!(rel = %rel.name, block, offnum, "heap insert");
    Ok(tid)
}

fn page_add_item_checked(page: &mut [u8], tup: &[u8]) -> Result<OffsetNumber> {
    crate::storage::page::page_add_item(page, tup, None)
        .ok_or_else(|| DbError::Storage("page overflow during insert".into()))
}

fn mark_write(env: &mut Env, rel: &Relation) {
    env.buffers.did_write = true;
    if !rel.xact_only {
        env.transaction.shared_buffer_changed = true;
    }
}

/// Stamp the deletion on a tuple the caller has located. Loops through
/// conflicting in-progress modifiers via the xact lock table.
fn stamp_delete(
    db: &Database,
    env: &mut Env,
    _rel: &Relation,
    buf: FrameId,
    offnum: OffsetNumber,
) -> Result<HeapResult> {
    let xid = crate::transaction::current_xid(env);
    let cmdid = env.transaction.current.cmdid;
    loop {
        let waiting_on;
        {
            let page = db.page_mut(env, buf);
            if offnum == 0 || offnum > page_max_offset(page) {
                return Ok(HeapResult::ConcurrentlyUpdated);
            }
            let lp = page_item_id(page, offnum);
            if !lp.is_used() {
                return Ok(HeapResult::ConcurrentlyUpdated);
            }
            let range = lp.off as usize..lp.off as usize + lp.len as usize;
            let tup = &mut page[range];
            let mask = tuple_get_infomask(tup);
            let xmax = tuple_get_xmax(tup);

            if mask & HEAP_XMAX_INVALID != 0 || xmax == 0 {
                // free to delete
                tuple_set_xmax(tup, xid);
                tuple_set_cmax(tup, cmdid);
                tuple_set_infomask(
                    tup,
                    mask & !(HEAP_XMAX_INVALID | HEAP_XMAX_COMMITTED | HEAP_MARKED_FOR_UPDATE),
                );
                return Ok(HeapResult::Ok);
            }
            if xmax == xid {
                return Ok(HeapResult::SelfUpdated);
            }
            if mask & HEAP_XMAX_COMMITTED != 0 {
                return Ok(HeapResult::ConcurrentlyUpdated);
            }
            match db.xid_status(env, xmax)? {
                XidStatus::InProgress => {
                    waiting_on = xmax;
                }
                XidStatus::Abort => {
                    tuple_set_infomask(tup, mask | HEAP_XMAX_INVALID);
                    continue;
                }
                _ => return Ok(HeapResult::ConcurrentlyUpdated),
            }
        }
        // conflicting modifier still running: drop the page lock and
        // wait it out, then re-evaluate
        db.unlock_page(env, buf);
        db.lock_table().wait(waiting_on);
        db.lock_page(env, buf, LockMode::Exclusive);
    }
}

pub fn heap_delete(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    tid: ItemPointer,
) -> Result<HeapResult> {
    guard_writable(env)?;
    let buf = db.read_buffer(env, rel, tid.block)?;
    db.lock_page(env, buf, LockMode::Exclusive);
    let res = stamp_delete(db, env, rel, buf, tid.offnum);
    db.unlock_page(env, buf);
    match res {
        Ok(HeapResult::Ok) => {
            mark_write(env, rel);
            db.write_buffer(env, rel, buf)?;
            Ok(HeapResult::Ok)
        }
        other => {
            db.release_buffer(env, buf);
            other
        }
    }
}

/// Delete + insert forming the update chain: the old tuple's ctid is
/// pointed at the new location.
pub fn heap_update(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    otid: ItemPointer,
    values: &[Datum],
    nulls: &[bool],
) -> Result<(HeapResult, Option<ItemPointer>)> {
    guard_writable(env)?;

    let obuf = db.read_buffer(env, rel, otid.block)?;
    db.lock_page(env, obuf, LockMode::Exclusive);
    match stamp_delete(db, env, rel, obuf, otid.offnum)? {
        HeapResult::Ok => {}
        other => {
            db.unlock_page(env, obuf);
            db.release_buffer(env, obuf);
            return Ok((other, None));
        }
    }
    db.unlock_page(env, obuf);

    // place the replacement; possibly on another page
    let ntid = heap_insert(db, env, rel, values, nulls)?;

    // chain the old version to the new location
    db.lock_page(env, obuf, LockMode::Exclusive);
    {
        let page = db.page_mut(env, obuf);
        let lp = page_item_id(page, otid.offnum);
        let range = lp.off as usize..lp.off as usize + lp.len as usize;
        tuple_set_ctid(&mut page[range], ntid);
    }
    db.unlock_page(env, obuf);

    mark_write(env, rel);
    db.write_buffer(env, rel, obuf)?;
    Ok((HeapResult::Ok, Some(ntid)))
}
