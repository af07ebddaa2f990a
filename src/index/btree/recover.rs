// Post-crash page recovery.
//
// Validates a page's parent and sibling links, excises leaf entries
// whose heap tuples no longer exist, reaps empty orphans, absorbs the
// right half of a split that never reached its parent, and collapses a
// root down to its single child. Returns the block that was reaped,
// when one was.

use std::sync::Arc;
use tracing::info;

use crate::common::{BlockNumber, INVALID_BLOCK};
use crate::db::Database;
use crate::env::Env;
use crate::error::Result;
use crate::relation::Relation;
use crate::storage::page::{
    page_get_item, page_index_tuple_delete, page_is_new, page_item_id, page_max_offset, BLCKSZ,
};

use super::item::{item_get_downlink, item_get_tid};
use super::page::{
    bt_opaque, bt_page_init, bt_read_meta, bt_set_opaque, bt_write_meta, BTP_LEAF, BTP_REAPED,
    BTP_ROOT, BTP_SPLIT, BTREE_METAPAGE,
};
use super::{bt_getbuf, bt_page_is_empty, bt_relbuf, bt_wrtbuf, BT_READ, BT_WRITE};

/// Consistency pass over one page. `heap` enables leaf reference
/// validation.
pub fn btrecoverpage(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    heap: Option<&Arc<Relation>>,
    block: BlockNumber,
) -> Result<Option<BlockNumber>> {
    if block == BTREE_METAPAGE || block >= rel.nblocks()? {
        return Ok(None);
    }

    let buf = bt_getbuf(db, env, rel, block, BT_WRITE)?;

    if page_is_new(db.page(env, buf)) {
        let page = db.page_mut(env, buf);
        bt_page_init(page, BTP_REAPED, INVALID_BLOCK);
        bt_wrtbuf(db, env, rel, buf)?;
        return Ok(Some(block));
    }

    let op = bt_opaque(db.page(env, buf));
    if op.is_split() {
        bt_relbuf(db, env, buf);
        return Ok(None);
    }
    if op.is_reaped() {
        bt_relbuf(db, env, buf);
        return Ok(Some(block));
    }
    let empty = bt_page_is_empty(db.page(env, buf), &op);
    if !op.is_root() && op.invalid_parent() && op.is_rightmost() && op.is_leftmost() && empty {
        let page = db.page_mut(env, buf);
        let mut o = bt_opaque(page);
        o.flags |= BTP_REAPED;
        bt_set_opaque(page, &o);
        bt_wrtbuf(db, env, rel, buf)?;
        return Ok(Some(block));
    }

    let mut changed = false;
    if !empty {
        if op.is_leaf() {
            if let Some(heap_rel) = heap {
                changed = excise_dead_leaf_entries(db, env, rel, heap_rel, buf, block)?;
            }
        } else {
            changed = excise_dead_downlinks(db, env, rel, buf, block)?;
        }
    }

    if changed {
        bt_wrtbuf(db, env, rel, buf)?;
    } else {
        bt_relbuf(db, env, buf);
    }

    check_pagelinks(db, env, rel, block)
}

/// Drop leaf entries whose heap tuples are gone.
fn excise_dead_leaf_entries(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    heap: &Arc<Relation>,
    buf: crate::common::FrameId,
    block: BlockNumber,
) -> Result<bool> {
    let heap_blocks = heap.nblocks()?;
    let mut changed = false;
    let first = bt_opaque(db.page(env, buf)).first_data_key();
    let mut off = first;
    loop {
        let maxoff = page_max_offset(db.page(env, buf));
        if off > maxoff {
            break;
        }
        let tid = {
            let page = db.page(env, buf);
            let lp = page_item_id(page, off);
            if !lp.is_used() {
                off += 1;
                continue;
            }
            item_get_tid(page_get_item(page, off))
        };

        let mut delete_it = tid.block >= heap_blocks || tid.offnum == 0;
        if !delete_it {
            let hbuf = db.read_buffer(env, heap, tid.block)?;
            db.lock_page(env, hbuf, BT_READ);
            {
                let hpage = db.page(env, hbuf);
                if tid.offnum > page_max_offset(hpage)
                    || !page_item_id(hpage, tid.offnum).is_used()
                {
                    delete_it = true;
                }
            }
            db.unlock_page(env, hbuf);
            db.release_buffer(env, hbuf);
        }

        if delete_it {
            info!(
                index = %rel.name,
                block, offset = off, "removing btree leaf entry with dead heap reference"
            );
            page_index_tuple_delete(db.page_mut(env, buf), off);
            changed = true;
        } else {
            off += 1;
        }
    }
    Ok(changed)
}

/// Drop internal entries whose child pages are missing or orphaned.
fn excise_dead_downlinks(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    buf: crate::common::FrameId,
    block: BlockNumber,
) -> Result<bool> {
    let relsize = rel.nblocks()?;
    let mut changed = false;
    let first = bt_opaque(db.page(env, buf)).first_data_key();
    let mut off = first;
    loop {
        let maxoff = page_max_offset(db.page(env, buf));
        if off > maxoff {
            break;
        }
        let child = {
            let page = db.page(env, buf);
            let lp = page_item_id(page, off);
            if !lp.is_used() {
                off += 1;
                continue;
            }
            item_get_downlink(page_get_item(page, off))
        };

        let mut delete_it = child == block || child == BTREE_METAPAGE || child >= relsize;
        if !delete_it {
            let cbuf = bt_getbuf(db, env, rel, child, BT_WRITE)?;
            let cop = bt_opaque(db.page(env, cbuf));
            if cop.is_reaped() || cop.invalid_parent() {
                delete_it = true;
                bt_relbuf(db, env, cbuf);
            } else if bt_page_is_empty(db.page(env, cbuf), &cop) && !cop.is_rightmost() {
                // empty mid-chain child: orphan it and drop the link
                delete_it = true;
                let cpage = db.page_mut(env, cbuf);
                let mut c = bt_opaque(cpage);
                c.parent = INVALID_BLOCK;
                bt_set_opaque(cpage, &c);
                bt_wrtbuf(db, env, rel, cbuf)?;
            } else {
                bt_relbuf(db, env, cbuf);
            }
        }

        if delete_it {
            info!(
                index = %rel.name,
                block, offset = off, child, "removing btree downlink to dead child"
            );
            page_index_tuple_delete(db.page_mut(env, buf), off);
            changed = true;
        } else {
            off += 1;
        }
    }
    Ok(changed)
}

/// Sibling / root link validation for one page.
fn check_pagelinks(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    target: BlockNumber,
) -> Result<Option<BlockNumber>> {
    let tbuf = bt_getbuf(db, env, rel, target, BT_WRITE)?;

    if page_is_new(db.page(env, tbuf)) {
        let page = db.page_mut(env, tbuf);
        bt_page_init(page, BTP_REAPED, INVALID_BLOCK);
        bt_wrtbuf(db, env, rel, tbuf)?;
        return Ok(Some(target));
    }
    let top = bt_opaque(db.page(env, tbuf));
    if top.is_reaped() {
        bt_relbuf(db, env, tbuf);
        return Ok(Some(target));
    }

    if top.is_root() {
        let single_child =
            !top.is_leaf() && page_max_offset(db.page(env, tbuf)) == top.first_data_key();
        bt_relbuf(db, env, tbuf);
        if !single_child {
            return Ok(None);
        }
        return collapse_root(db, env, rel);
    }

    if top.is_leftmost() && top.invalid_parent() {
        // orphaned leftmost page: splice it out of the chain
        debug_assert!(!top.is_rightmost());
        let nbuf = bt_getbuf(db, env, rel, top.next, BT_WRITE)?;
        {
            let npage = db.page_mut(env, nbuf);
            let mut n = bt_opaque(npage);
            n.prev = super::page::P_NONE;
            bt_set_opaque(npage, &n);
        }
        {
            let tpage = db.page_mut(env, tbuf);
            let mut t = bt_opaque(tpage);
            t.flags |= BTP_REAPED;
            bt_set_opaque(tpage, &t);
        }
        bt_wrtbuf(db, env, rel, nbuf)?;
        bt_wrtbuf(db, env, rel, tbuf)?;
        return Ok(Some(target));
    }

    if top.is_rightmost() {
        bt_relbuf(db, env, tbuf);
        return Ok(None);
    }

    let nbuf = bt_getbuf(db, env, rel, top.next, BT_WRITE)?;
    let nop = bt_opaque(db.page(env, nbuf));

    if nop.invalid_parent() {
        if nop.prev == top.prev && nop.is_split() {
            // a split that never reached the parent: absorb the right
            // half back into the target
            let image: Vec<u8> = db.page(env, nbuf).to_vec();
            {
                let tpage = db.page_mut(env, tbuf);
                tpage.copy_from_slice(&image[..BLCKSZ]);
                let mut t = bt_opaque(tpage);
                t.parent = top.parent;
                t.flags &= !BTP_SPLIT;
                bt_set_opaque(tpage, &t);
            }
            let reaped = top.next;
            {
                let npage = db.page_mut(env, nbuf);
                bt_page_init(npage, BTP_REAPED, INVALID_BLOCK);
            }
            bt_wrtbuf(db, env, rel, nbuf)?;
            bt_wrtbuf(db, env, rel, tbuf)?;
            return Ok(Some(reaped));
        }
        if bt_page_is_empty(db.page(env, nbuf), &nop) {
            // empty orphan between us and its successor: unlink it
            let reaped = top.next;
            {
                let npage = db.page_mut(env, nbuf);
                let mut n = bt_opaque(npage);
                n.flags |= BTP_REAPED;
                bt_set_opaque(npage, &n);
            }
            if nop.next != super::page::P_NONE {
                let sbuf = bt_getbuf(db, env, rel, nop.next, BT_WRITE)?;
                let spage = db.page_mut(env, sbuf);
                let mut s = bt_opaque(spage);
                s.prev = target;
                bt_set_opaque(spage, &s);
                bt_wrtbuf(db, env, rel, sbuf)?;
            }
            {
                let tpage = db.page_mut(env, tbuf);
                let mut t = bt_opaque(tpage);
                t.next = nop.next;
                bt_set_opaque(tpage, &t);
            }
            bt_wrtbuf(db, env, rel, nbuf)?;
            bt_wrtbuf(db, env, rel, tbuf)?;
            return Ok(Some(reaped));
        }
        bt_relbuf(db, env, nbuf);
        bt_relbuf(db, env, tbuf);
        return Ok(None);
    }

    // plain back-link repair
    if nop.prev != target {
        let npage = db.page_mut(env, nbuf);
        let mut n = bt_opaque(npage);
        n.prev = target;
        bt_set_opaque(npage, &n);
        bt_wrtbuf(db, env, rel, nbuf)?;
    } else {
        bt_relbuf(db, env, nbuf);
    }
    bt_relbuf(db, env, tbuf);
    Ok(None)
}

/// Collapse a single-child root chain down to its lowest member and
/// point the meta page at it.
fn collapse_root(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
) -> Result<Option<BlockNumber>> {
    let mbuf = bt_getbuf(db, env, rel, BTREE_METAPAGE, BT_WRITE)?;
    let mut meta = bt_read_meta(db.page(env, mbuf));
    let mut reaped = None;

    let mut root = meta.root;
    let mut rbuf = bt_getbuf(db, env, rel, root, BT_WRITE)?;
    loop {
        let rop = bt_opaque(db.page(env, rbuf));
        let single =
            !rop.is_leaf() && page_max_offset(db.page(env, rbuf)) == rop.first_data_key();
        if !single {
            break;
        }
        let child = {
            let page = db.page(env, rbuf);
            item_get_downlink(page_get_item(page, rop.first_data_key()))
        };
        let cbuf = bt_getbuf(db, env, rel, child, BT_WRITE)?;
        {
            let cpage = db.page_mut(env, cbuf);
            let mut c = bt_opaque(cpage);
            c.flags |= BTP_ROOT;
            c.parent = BTREE_METAPAGE;
            bt_set_opaque(cpage, &c);
        }
        meta.root = child;
        meta.level = meta.level.saturating_sub(1);
        {
            let rpage = db.page_mut(env, rbuf);
            let mut r = bt_opaque(rpage);
            r.flags = (r.flags | BTP_REAPED) & !(BTP_ROOT | BTP_LEAF);
            bt_set_opaque(rpage, &r);
        }
        info!(index = %rel.name, old_root = root, new_root = child, "collapsing btree root");
        bt_wrtbuf(db, env, rel, rbuf)?;
        reaped = Some(root);
        rbuf = cbuf;
        root = child;
    }
    bt_relbuf(db, env, rbuf);
    {
        let mpage = db.page_mut(env, mbuf);
        bt_write_meta(mpage, &meta);
    }
    bt_wrtbuf(db, env, rel, mbuf)?;
    Ok(reaped)
}
