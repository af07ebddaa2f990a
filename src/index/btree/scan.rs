// B-tree scans.
//
// A scan keeps a pin (but not a lock) on the leaf holding its current
// position between calls, plus the heap TID and key of the last tuple
// it returned. Resumption re-grabs the read lock and, if concurrent
// inserts shifted the anchor tuple right, walks the sibling chain until
// it is found; if the anchor itself was deleted, the scan resumes at
// the first surviving entry past its stop point.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::{Datum, FrameId, ItemPointer, OffsetNumber, ScanKey, SkOp};
use crate::db::Database;
use crate::env::Env;
use crate::error::Result;
use crate::relation::Relation;
use crate::storage::page::{page_get_item, page_item_id, page_max_offset};

use super::item::{cmp_keys, item_get_tid, item_key, IndexKey};
use super::page::{bt_opaque, P_NONE};
use super::{bt_getbuf, bt_leftmost_leaf, bt_relbuf, bt_search, BT_READ};

pub struct BtScan {
    pub rel: Arc<Relation>,
    keys: Vec<ScanKey>,
    buf: Option<FrameId>,
    /// Current index position `(block, offnum)`.
    pos: ItemPointer,
    /// Anchor of the last returned entry.
    cur_heap_tid: ItemPointer,
    cur_key: Option<IndexKey>,
    mark: Option<(ItemPointer, ItemPointer, Option<IndexKey>)>,
    done: bool,
}

pub fn btbeginscan(rel: Arc<Relation>, keys: Vec<ScanKey>) -> BtScan {
    BtScan {
        rel,
        keys,
        buf: None,
        pos: ItemPointer::invalid(),
        cur_heap_tid: ItemPointer::invalid(),
        cur_key: None,
        mark: None,
        done: false,
    }
}

pub fn btendscan(db: &Database, env: &mut Env, scan: &mut BtScan) {
    if let Some(buf) = scan.buf.take() {
        db.release_buffer(env, buf);
    }
    scan.done = true;
}

pub fn btmarkpos(scan: &mut BtScan) {
    scan.mark = Some((scan.pos, scan.cur_heap_tid, scan.cur_key.clone()));
}

pub fn btrestrpos(db: &Database, env: &mut Env, scan: &mut BtScan) -> Result<()> {
    if let Some((pos, heap_tid, key)) = scan.mark.clone() {
        if let Some(buf) = scan.buf.take() {
            db.release_buffer(env, buf);
        }
        if pos.is_valid() {
            let buf = db.read_buffer(env, &scan.rel.clone(), pos.block)?;
            scan.buf = Some(buf);
        }
        scan.pos = pos;
        scan.cur_heap_tid = heap_tid;
        scan.cur_key = key;
        scan.done = false;
    }
    Ok(())
}

/// Bound key assembled from the leading equality/lower-bound scan
/// keys, used to pick the starting leaf.
fn start_key(scan: &BtScan) -> Option<IndexKey> {
    let natts = scan.rel.desc.natts();
    let mut bound: Vec<Option<Datum>> = Vec::new();
    for attno in 1..=natts as u16 {
        let key = scan
            .keys
            .iter()
            .find(|k| k.attnum == attno && matches!(k.op, SkOp::Eq | SkOp::Ge | SkOp::Gt));
        match key {
            Some(k) => bound.push(Some(k.arg.clone())),
            None => break,
        }
    }
    if bound.is_empty() {
        None
    } else {
        Some(bound)
    }
}

/// Does the item satisfy the scan keys, and if not, can anything to
/// the right still qualify?
fn check_keys(scan: &BtScan, key: &IndexKey) -> (bool, bool) {
    let mut matches = true;
    for sk in &scan.keys {
        let attno = (sk.attnum - 1) as usize;
        let value = match &key[attno] {
            Some(v) => v,
            None => {
                // nulls sort last; a bounded scan on the leading
                // attribute is over once it reaches them
                if attno == 0 && matches!(sk.op, SkOp::Eq | SkOp::Lt | SkOp::Le) {
                    return (false, false);
                }
                matches = false;
                continue;
            }
        };
        let ord = value.compare(&sk.arg);
        if !sk.op.evaluate(ord) {
            matches = false;
            if attno == 0
                && ord == Ordering::Greater
                && matches!(sk.op, SkOp::Eq | SkOp::Lt | SkOp::Le)
            {
                return (false, false);
            }
        }
    }
    (matches, true)
}

/// Advance the scan and return the next matching heap TID. The page
/// lock is dropped before returning; the pin stays.
pub fn btgettuple(db: &Database, env: &mut Env, scan: &mut BtScan) -> Result<Option<ItemPointer>> {
    if scan.done {
        return Ok(None);
    }
    env.check_for_cancel()?;

    let found = if scan.pos.is_valid() {
        bt_restscan(db, env, scan)?;
        bt_step(db, env, scan)?
    } else {
        bt_first(db, env, scan)?
    };

    match found {
        Some(tid) => {
            scan.cur_heap_tid = tid;
            if let Some(buf) = scan.buf {
                let page = db.page(env, buf);
                scan.cur_key = Some(item_key(&scan.rel.desc, page_get_item(page, scan.pos.offnum)));
                db.unlock_page(env, buf);
            }
            Ok(Some(tid))
        }
        None => {
            if let Some(buf) = scan.buf.take() {
                db.unlock_page(env, buf);
                db.release_buffer(env, buf);
            }
            scan.done = true;
            Ok(None)
        }
    }
}

/// Position before the first candidate item and step onto it. Returns
/// with the leaf read-locked when an item was found.
fn bt_first(db: &Database, env: &mut Env, scan: &mut BtScan) -> Result<Option<ItemPointer>> {
    let rel = scan.rel.clone();
    let buf = match start_key(scan) {
        Some(bound) => {
            let (buf, block) = bt_search(db, env, &rel, &bound)?;
            let off = first_candidate_off(db, env, scan, buf, &bound);
            scan.pos = ItemPointer::new(block, off.saturating_sub(1));
            buf
        }
        None => {
            let block = bt_leftmost_leaf(db, env, &rel)?;
            let buf = bt_getbuf(db, env, &rel, block, BT_READ)?;
            let op = bt_opaque(db.page(env, buf));
            scan.pos = ItemPointer::new(block, op.first_data_key().saturating_sub(1));
            buf
        }
    };
    scan.buf = Some(buf);
    bt_step(db, env, scan)
}

fn first_candidate_off(
    db: &Database,
    env: &mut Env,
    scan: &BtScan,
    buf: FrameId,
    bound: &IndexKey,
) -> OffsetNumber {
    let page = db.page(env, buf);
    let op = bt_opaque(page);
    let maxoff = page_max_offset(page);
    let mut off = op.first_data_key();
    while off <= maxoff {
        let lp = page_item_id(page, off);
        if lp.is_used() {
            let k = item_key(&scan.rel.desc, page_get_item(page, off));
            let prefix: IndexKey = k.iter().take(bound.len()).cloned().collect();
            if cmp_keys(&prefix, bound) != Ordering::Less {
                break;
            }
        }
        off += 1;
    }
    off
}

/// One step right from the current position. The caller holds the read
/// lock on `scan.buf`; on success the lock is still held.
fn bt_step(db: &Database, env: &mut Env, scan: &mut BtScan) -> Result<Option<ItemPointer>> {
    let rel = scan.rel.clone();
    loop {
        let buf = match scan.buf {
            Some(b) => b,
            None => return Ok(None),
        };
        let (maxoff, next, first) = {
            let page = db.page(env, buf);
            let op = bt_opaque(page);
            (page_max_offset(page), op.next, op.first_data_key())
        };
        let mut off = if scan.pos.offnum < first {
            first
        } else {
            scan.pos.offnum + 1
        };

        while off <= maxoff {
            let page = db.page(env, buf);
            let lp = page_item_id(page, off);
            if !lp.is_used() {
                off += 1;
                continue;
            }
            let key = item_key(&rel.desc, page_get_item(page, off));
            let (matches, keep_going) = check_keys(scan, &key);
            if matches {
                scan.pos = ItemPointer::new(scan.pos.block, off);
                return Ok(Some(item_get_tid(page_get_item(page, off))));
            }
            if !keep_going {
                return Ok(None);
            }
            off += 1;
        }

        if next == P_NONE {
            return Ok(None);
        }
        let nbuf = bt_getbuf(db, env, &rel, next, BT_READ)?;
        bt_relbuf(db, env, buf);
        scan.buf = Some(nbuf);
        scan.pos = ItemPointer::new(next, 0);
    }
}

/// Re-acquire the read lock and find the anchor again. Inserts can
/// only have moved it right; if it is gone altogether (bulk delete),
/// resume just before the first surviving entry past the stop point.
fn bt_restscan(db: &Database, env: &mut Env, scan: &mut BtScan) -> Result<()> {
    let rel = scan.rel.clone();
    let buf = match scan.buf {
        Some(b) => b,
        None => return Ok(()),
    };
    db.lock_page(env, buf, BT_READ);

    if !scan.cur_heap_tid.is_valid() {
        return Ok(());
    }
    let target = scan.cur_heap_tid;
    let anchor_key = scan.cur_key.clone();

    let mut cur = buf;
    loop {
        let page = db.page(env, cur);
        let op = bt_opaque(page);
        let maxoff = page_max_offset(page);

        for off in op.first_data_key()..=maxoff {
            let lp = page_item_id(page, off);
            if !lp.is_used() {
                continue;
            }
            if item_get_tid(page_get_item(page, off)) == target {
                scan.pos = ItemPointer::new(scan.pos.block, off);
                return Ok(());
            }
        }

        // not here by TID; if this page already holds keys past the
        // anchor, the anchor was deleted
        if let Some(ak) = &anchor_key {
            for off in op.first_data_key()..=maxoff {
                let lp = page_item_id(page, off);
                if !lp.is_used() {
                    continue;
                }
                let k = item_key(&rel.desc, page_get_item(page, off));
                if cmp_keys(&k, ak) == Ordering::Greater {
                    // resume right before the first survivor
                    scan.pos = ItemPointer::new(scan.pos.block, off - 1);
                    scan.cur_heap_tid = ItemPointer::invalid();
                    return Ok(());
                }
            }
        }

        if op.is_rightmost() {
            // nothing past the stop point anywhere: park at the end
            scan.pos = ItemPointer::new(scan.pos.block, maxoff);
            scan.cur_heap_tid = ItemPointer::invalid();
            return Ok(());
        }
        let next = op.next;
        let nbuf = bt_getbuf(db, env, &rel, next, BT_READ)?;
        bt_relbuf(db, env, cur);
        scan.buf = Some(nbuf);
        scan.pos = ItemPointer::new(next, 0);
        cur = nbuf;
    }
}
