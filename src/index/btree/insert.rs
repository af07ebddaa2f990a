// B-tree insertion: descend, split on overflow, re-insert the new
// separator in the parent. A split leaves the new right page flagged
// SPLIT until its parent downlink is in place; recovery uses the flag
// to spot half-done splits.

use tracing::debug;

use crate::buffer::LockMode;
use crate::common::{BlockNumber, FrameId, ItemPointer, P_NEW};
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::heap::visibility::{tuple_satisfies_vacuum, VacuumStatus};
use crate::relation::Relation;
use crate::storage::page::{
    maxalign, page_add_item, page_free_space, page_get_item, page_item_id, page_max_offset,
    ITEMID_SIZE,
};

use super::item::{cmp_keys, index_form_item, item_get_tid, item_key, IndexKey};
use super::page::{
    bt_opaque, bt_page_init, bt_read_meta, bt_set_opaque, bt_write_meta, BTP_LEAF, BTP_ROOT,
    BTP_SPLIT, BTREE_METAPAGE, P_NONE,
};
use super::{
    bt_find_insert_off, bt_getbuf, bt_moveright, bt_relbuf, bt_search, bt_wrtbuf, BT_READ,
    BT_WRITE,
};

/// Insert one index entry. With `unique`, equal keys referencing live
/// heap tuples are rejected; dead duplicates are tolerated.
pub fn bt_doinsert(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    heap: Option<&Relation>,
    key: &IndexKey,
    tid: ItemPointer,
    unique: bool,
) -> Result<()> {
    let item = index_form_item(&rel.desc, key, tid);

    let (buf, block) = bt_search(db, env, rel, key)?;
    // trade the read lock for a write lock, then compensate for any
    // split that happened in between
    db.unlock_page(env, buf);
    db.lock_page(env, buf, BT_WRITE);
    let (buf, block) = bt_moveright(db, env, rel, buf, block, key, BT_WRITE)?;

    if unique {
        if let Some(heap_rel) = heap {
            check_unique(db, env, rel, heap_rel, buf, key, tid)?;
        }
    }

    insert_on_page(db, env, rel, buf, block, key, &item)
}

/// Scan equal keys on the locked leaf (and right siblings while the
/// run continues) for a conflicting live heap tuple.
fn check_unique(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    heap: &Relation,
    buf: FrameId,
    key: &IndexKey,
    our_tid: ItemPointer,
) -> Result<()> {
    let mut cur = buf;
    let mut extra: Option<FrameId> = None;
    loop {
        let page = db.page(env, cur);
        let op = bt_opaque(page);
        let maxoff = page_max_offset(page);
        let mut conflicts: Vec<ItemPointer> = Vec::new();
        for off in op.first_data_key()..=maxoff {
            let lp = page_item_id(page, off);
            if !lp.is_used() {
                continue;
            }
            let it = page_get_item(page, off);
            if cmp_keys(&item_key(&rel.desc, it), key) == std::cmp::Ordering::Equal {
                let t = item_get_tid(it);
                if t != our_tid {
                    conflicts.push(t);
                }
            }
        }
        let continues_right = match super::high_key(db, env, rel, cur) {
            Some(hk) => cmp_keys(key, &hk) == std::cmp::Ordering::Equal,
            None => false,
        };
        let next = bt_opaque(db.page(env, cur)).next;

        for t in conflicts {
            if heap_tuple_alive(db, env, heap, t)? {
                if let Some(e) = extra {
                    bt_relbuf(db, env, e);
                }
                return Err(DbError::Storage(format!(
                    "duplicate key in unique index {}",
                    rel.name
                )));
            }
        }

        if !continues_right || next == P_NONE {
            if let Some(e) = extra {
                bt_relbuf(db, env, e);
            }
            return Ok(());
        }
        let nbuf = bt_getbuf(db, env, rel, next, BT_READ)?;
        if let Some(e) = extra {
            bt_relbuf(db, env, e);
        }
        extra = Some(nbuf);
        cur = nbuf;
    }
}

fn heap_tuple_alive(
    db: &Database,
    env: &mut Env,
    heap: &Relation,
    tid: ItemPointer,
) -> Result<bool> {
    if tid.block >= heap.nblocks()? {
        return Ok(false);
    }
    let buf = db.read_buffer(env, heap, tid.block)?;
    db.lock_page(env, buf, LockMode::Share);
    let alive = (|| -> Result<bool> {
        let page = db.page(env, buf);
        if tid.offnum == 0 || tid.offnum > page_max_offset(page) {
            return Ok(false);
        }
        let lp = page_item_id(page, tid.offnum);
        if !lp.is_used() {
            return Ok(false);
        }
        let tup = page_get_item(page, tid.offnum).to_vec();
        let xid = crate::transaction::current_xid(env);
        let oldest = db.oldest_running_xid();
        let status = tuple_satisfies_vacuum(db, env, &tup, xid, oldest)?;
        Ok(matches!(
            status,
            VacuumStatus::Live | VacuumStatus::InsertInProgress | VacuumStatus::DeleteInProgress
        ))
    })();
    db.unlock_page(env, buf);
    db.release_buffer(env, buf);
    alive
}

/// Place an item on a write-locked page, splitting on overflow. The
/// lock is consumed either way.
pub fn insert_on_page(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    buf: FrameId,
    block: BlockNumber,
    key: &IndexKey,
    item: &[u8],
) -> Result<()> {
    let needed = maxalign(item.len()) + ITEMID_SIZE;
    if page_free_space(db.page(env, buf)) >= needed {
        let off = bt_find_insert_off(db, env, rel, buf, key);
        let page = db.page_mut(env, buf);
        let placed = page_add_item(page, item, Some(off));
        debug_assert!(placed.is_some());
        bt_wrtbuf(db, env, rel, buf)?;
        return Ok(());
    }
    bt_split_and_insert(db, env, rel, buf, block, key, item)
}

/// Split a full page and insert the pending item into the proper half.
fn bt_split_and_insert(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    lbuf: FrameId,
    lblock: BlockNumber,
    key: &IndexKey,
    item: &[u8],
) -> Result<()> {
    let (items, old_high, op) = {
        let page = db.page(env, lbuf);
        let op = bt_opaque(page);
        let first = op.first_data_key();
        let maxoff = page_max_offset(page);
        let mut items: Vec<Vec<u8>> = Vec::with_capacity(maxoff as usize);
        for off in first..=maxoff {
            let lp = page_item_id(page, off);
            if lp.is_used() {
                items.push(page_get_item(page, off).to_vec());
            }
        }
        let old_high = if op.is_rightmost() {
            None
        } else {
            Some(page_get_item(page, 1).to_vec())
        };
        (items, old_high, op)
    };

    // merge the pending item into key order
    let mut all = items;
    let pos = all.partition_point(|it| {
        cmp_keys(&item_key(&rel.desc, it), key) != std::cmp::Ordering::Greater
    });
    let pos = if op.is_leaf() { pos } else { pos.max(1) };
    all.insert(pos, item.to_vec());

    let mid = (all.len() / 2).max(1);
    let (left_items, right_items) = all.split_at(mid);
    debug!(
        rel = %rel.name,
        block = lblock,
        left = left_items.len(),
        right = right_items.len(),
        "btree page split"
    );

    // build the right page
    let rbuf = bt_getbuf(db, env, rel, P_NEW, BT_WRITE)?;
    let rblock = db.block_of(env, rbuf);
    let leaf_flag = if op.is_leaf() { BTP_LEAF } else { 0 };
    {
        let rpage = db.page_mut(env, rbuf);
        bt_page_init(rpage, leaf_flag | BTP_SPLIT, op.parent);
        let mut rop = bt_opaque(rpage);
        rop.prev = lblock;
        rop.next = op.next;
        bt_set_opaque(rpage, &rop);
        if let Some(hk) = &old_high {
            page_add_item(rpage, hk, None).expect("right page high key");
        }
        for it in right_items {
            page_add_item(rpage, it, None).expect("right page item");
        }
    }
    let sep_key = item_key(&rel.desc, &right_items[0]);
    let mut sep_item = right_items[0].clone();
    // separator points at the right page
    super::item::item_set_tid(&mut sep_item, ItemPointer::new(rblock, 0));

    // rebuild the left page: new high key, then its half of the items
    {
        let lpage = db.page_mut(env, lbuf);
        bt_page_init(lpage, op.flags & !BTP_ROOT, op.parent);
        let mut lop = bt_opaque(lpage);
        lop.prev = op.prev;
        lop.next = rblock;
        // root-ness is resolved below; split flag never applies to the
        // left half
        lop.flags = op.flags & !(BTP_SPLIT | BTP_ROOT);
        bt_set_opaque(lpage, &lop);
        page_add_item(lpage, &right_items[0], None).expect("left page high key");
        for it in left_items {
            page_add_item(lpage, it, None).expect("left page item");
        }
    }

    // fix the old right sibling's back link
    if op.next != P_NONE {
        let sbuf = bt_getbuf(db, env, rel, op.next, BT_WRITE)?;
        let spage = db.page_mut(env, sbuf);
        let mut sop = bt_opaque(spage);
        sop.prev = rblock;
        bt_set_opaque(spage, &sop);
        bt_wrtbuf(db, env, rel, sbuf)?;
    }

    let was_root = op.is_root() || op.parent == BTREE_METAPAGE;
    if was_root {
        // grow the tree: new root holds downlinks to both halves
        let nbuf = bt_getbuf(db, env, rel, P_NEW, BT_WRITE)?;
        let nblock = db.block_of(env, nbuf);
        {
            let npage = db.page_mut(env, nbuf);
            bt_page_init(npage, BTP_ROOT, BTREE_METAPAGE);
            let mut left_link = left_items[0].clone();
            super::item::item_set_tid(&mut left_link, ItemPointer::new(lblock, 0));
            page_add_item(npage, &left_link, None).expect("root left downlink");
            page_add_item(npage, &sep_item, None).expect("root right downlink");
        }
        for (b, blk) in [(lbuf, lblock), (rbuf, rblock)] {
            let page = db.page_mut(env, b);
            let mut o = bt_opaque(page);
            o.parent = nblock;
            o.flags &= !(BTP_ROOT | BTP_SPLIT);
            if blk == lblock {
                o.flags &= !BTP_SPLIT;
            }
            bt_set_opaque(page, &o);
        }
        let mbuf = bt_getbuf(db, env, rel, BTREE_METAPAGE, BT_WRITE)?;
        {
            let mpage = db.page_mut(env, mbuf);
            let mut meta = bt_read_meta(mpage);
            meta.root = nblock;
            meta.level += 1;
            bt_write_meta(mpage, &meta);
        }
        bt_wrtbuf(db, env, rel, mbuf)?;
        bt_wrtbuf(db, env, rel, nbuf)?;
        bt_wrtbuf(db, env, rel, lbuf)?;
        bt_wrtbuf(db, env, rel, rbuf)?;
        return Ok(());
    }

    let parent = op.parent;
    bt_wrtbuf(db, env, rel, lbuf)?;
    bt_wrtbuf(db, env, rel, rbuf)?;

    // insert the separator one level up
    insert_into_parent(db, env, rel, parent, &sep_key, &sep_item)?;

    // the downlink exists; the right page is no longer mid-split
    let rbuf = bt_getbuf(db, env, rel, rblock, BT_WRITE)?;
    {
        let rpage = db.page_mut(env, rbuf);
        let mut rop = bt_opaque(rpage);
        rop.flags &= !BTP_SPLIT;
        bt_set_opaque(rpage, &rop);
    }
    bt_wrtbuf(db, env, rel, rbuf)
}

fn insert_into_parent(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    parent: BlockNumber,
    sep_key: &IndexKey,
    sep_item: &[u8],
) -> Result<()> {
    if parent == P_NONE || parent == crate::common::INVALID_BLOCK {
        return Err(DbError::Corrupted(format!(
            "split of {} lost its parent pointer",
            rel.name
        )));
    }
    let buf = bt_getbuf(db, env, rel, parent, BT_WRITE)?;
    let (buf, block) = bt_moveright(db, env, rel, buf, parent, sep_key, BT_WRITE)?;
    insert_on_page(db, env, rel, buf, block, sep_key, sep_item)
}
