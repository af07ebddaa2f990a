// Index build.
//
// The fast path spools the heap into memory, sorts, and bulk-loads the
// leaf level left to right, then builds each upper level over the one
// below it. Unique builds keep live and dead tuples in separate spools
// and merge dead entries behind live ones within equal keys, so the
// uniqueness check tolerates them at the right end of the key range.
// The legacy path simply drives every tuple through normal insertion.

use std::sync::Arc;
use tracing::info;

use crate::common::{BlockNumber, Datum, ItemPointer, P_NEW};
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::heap::tuple::heap_get_attr;
use crate::heap::visibility::tuple_satisfies_vacuum;
use crate::heap::{heap_beginscan, heap_endscan, heap_getnext};
use crate::relation::Relation;
use crate::storage::page::{
    maxalign, page_add_item, BLCKSZ, ITEMID_SIZE, PAGE_HEADER_SIZE,
};
use crate::transaction::snapshot::Snap;

use super::insert::bt_doinsert;
use super::item::{cmp_keys, index_form_item, item_set_tid, IndexKey};
use super::page::{
    bt_opaque, bt_page_init, bt_read_meta, bt_set_opaque, bt_write_meta, BTP_LEAF, BTP_ROOT,
    BTREE_METAPAGE, BT_SPECIAL_SIZE, P_NONE,
};
use super::{bt_getbuf, bt_metapinit, bt_wrtbuf, BT_WRITE};

/// Extract the index key for one heap tuple.
pub fn build_index_key(heap: &Relation, keyattrs: &[u16], tup: &[u8]) -> IndexKey {
    keyattrs
        .iter()
        .map(|&a| heap_get_attr(tup, a as i32, &heap.desc))
        .collect()
}

/// Build a new B-tree over `heap`. Returns the number of index tuples.
pub fn btbuild(
    db: &Database,
    env: &mut Env,
    heap: &Arc<Relation>,
    index: &Relation,
    unique: bool,
    use_fast: bool,
) -> Result<u64> {
    let keyattrs = index
        .index
        .as_ref()
        .map(|i| i.keyattrs.clone())
        .ok_or_else(|| DbError::Catalog(format!("{} is not an index", index.name)))?;

    if index.nblocks()? > 1 {
        return Err(DbError::Catalog(format!(
            "{} already contains data",
            index.name
        )));
    }
    if index.nblocks()? == 0 {
        bt_metapinit(db, env, index)?;
    }

    let cur_xid = crate::transaction::current_xid(env);
    let oldest = db.oldest_running_xid();

    let mut live: Vec<(IndexKey, ItemPointer)> = Vec::new();
    let mut dead: Vec<(IndexKey, ItemPointer)> = Vec::new();
    let mut reltuples: u64 = 0;

    let mut scan = heap_beginscan(db, env, heap.clone(), Snap::Any, Vec::new())?;
    while let Some(tup) = heap_getnext(db, env, &mut scan)? {
        env.check_for_cancel()?;
        reltuples += 1;
        let key = build_index_key(heap, &keyattrs, &tup.data);

        if use_fast {
            if unique {
                let status = tuple_satisfies_vacuum(db, env, &tup.data, cur_xid, oldest)?;
                if status.routes_dead() {
                    dead.push((key, tup.self_tid));
                } else {
                    live.push((key, tup.self_tid));
                }
            } else {
                live.push((key, tup.self_tid));
            }
        } else {
            bt_doinsert(db, env, index, Some(heap.as_ref()), &key, tup.self_tid, unique)?;
        }
    }
    heap_endscan(db, env, &mut scan);

    if !use_fast {
        info!(index = %index.name, tuples = reltuples, "legacy btree build");
        return Ok(reltuples);
    }

    let sort_key = |a: &(IndexKey, ItemPointer), b: &(IndexKey, ItemPointer)| {
        cmp_keys(&a.0, &b.0).then(a.1.cmp(&b.1))
    };
    live.sort_by(sort_key);
    dead.sort_by(sort_key);

    // merge: within equal keys, live entries come first
    let mut merged: Vec<(IndexKey, ItemPointer)> = Vec::with_capacity(live.len() + dead.len());
    {
        let mut li = live.into_iter().peekable();
        let mut di = dead.into_iter().peekable();
        loop {
            match (li.peek(), di.peek()) {
                (Some(l), Some(d)) => {
                    if cmp_keys(&l.0, &d.0) != std::cmp::Ordering::Greater {
                        merged.push(li.next().unwrap());
                    } else {
                        merged.push(di.next().unwrap());
                    }
                }
                (Some(_), None) => merged.push(li.next().unwrap()),
                (None, Some(_)) => merged.push(di.next().unwrap()),
                (None, None) => break,
            }
        }
    }

    let total = merged.len() as u64;
    bulk_load(db, env, index, merged)?;
    info!(index = %index.name, tuples = total, "fast btree build");
    Ok(total)
}

/// Usable bytes per page, with headroom for the high key.
fn fill_limit() -> usize {
    let capacity = BLCKSZ - PAGE_HEADER_SIZE - BT_SPECIAL_SIZE;
    capacity - capacity / 10
}

/// Materialize sorted entries into a left-to-right leaf chain and the
/// levels above it.
fn bulk_load(
    db: &Database,
    env: &mut Env,
    index: &Relation,
    entries: Vec<(IndexKey, ItemPointer)>,
) -> Result<()> {
    // pack items into per-leaf lists
    let mut pages: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut cur: Vec<Vec<u8>> = Vec::new();
    let mut cur_size = 0usize;
    for (key, tid) in &entries {
        let item = index_form_item(&index.desc, key, *tid);
        let need = maxalign(item.len()) + ITEMID_SIZE;
        if cur_size + need > fill_limit() && !cur.is_empty() {
            pages.push(std::mem::take(&mut cur));
            cur_size = 0;
        }
        cur_size += need;
        cur.push(item);
    }
    if !cur.is_empty() {
        pages.push(cur);
    }
    if pages.is_empty() {
        return Ok(());
    }

    let mut level_is_leaf = true;
    let mut level_pages = pages;
    let mut level_no = 0u32;
    loop {
        level_no += 1;
        let single = level_pages.len() == 1;
        let blocks = write_level(db, env, index, &level_pages, level_is_leaf, single)?;

        if single {
            // that page is the root
            let root = blocks[0];
            let mbuf = bt_getbuf(db, env, index, BTREE_METAPAGE, BT_WRITE)?;
            {
                let mpage = db.page_mut(env, mbuf);
                let mut meta = bt_read_meta(mpage);
                meta.root = root;
                meta.level = level_no;
                bt_write_meta(mpage, &meta);
            }
            bt_wrtbuf(db, env, index, mbuf)?;
            return Ok(());
        }

        // build the next level: one downlink per page just written
        let mut parent_items: Vec<Vec<u8>> = Vec::new();
        for (i, page_items) in level_pages.iter().enumerate() {
            let mut link = page_items[0].clone();
            item_set_tid(&mut link, ItemPointer::new(blocks[i], 0));
            parent_items.push(link);
        }
        // repack into parent pages
        let mut parents: Vec<Vec<Vec<u8>>> = Vec::new();
        let mut cur: Vec<Vec<u8>> = Vec::new();
        let mut cur_size = 0usize;
        for item in parent_items {
            let need = maxalign(item.len()) + ITEMID_SIZE;
            if cur_size + need > fill_limit() && !cur.is_empty() {
                parents.push(std::mem::take(&mut cur));
                cur_size = 0;
            }
            cur_size += need;
            cur.push(item);
        }
        if !cur.is_empty() {
            parents.push(cur);
        }

        level_pages = parents;
        level_is_leaf = false;

        // parent blocks are assigned on the next write_level pass; the
        // children keep their hints updated there
        set_parent_hints(db, env, index, &blocks, &level_pages)?;
    }
}

/// Write one level of pages, chaining siblings and installing high
/// keys. Returns the block numbers in order.
fn write_level(
    db: &Database,
    env: &mut Env,
    index: &Relation,
    level_pages: &[Vec<Vec<u8>>],
    is_leaf: bool,
    is_root: bool,
) -> Result<Vec<BlockNumber>> {
    let n = level_pages.len();
    let mut blocks = Vec::with_capacity(n);
    let mut bufs = Vec::with_capacity(n);
    // allocate first so sibling block numbers are known
    for _ in 0..n {
        let buf = bt_getbuf(db, env, index, P_NEW, BT_WRITE)?;
        blocks.push(db.block_of(env, buf));
        bufs.push(buf);
    }
    for i in 0..n {
        let page = db.page_mut(env, bufs[i]);
        let mut flags = if is_leaf { BTP_LEAF } else { 0 };
        if is_root && n == 1 {
            flags |= BTP_ROOT;
        }
        let parent = if is_root {
            BTREE_METAPAGE
        } else {
            crate::common::INVALID_BLOCK
        };
        bt_page_init(page, flags, parent);
        let mut op = bt_opaque(page);
        op.prev = if i == 0 { P_NONE } else { blocks[i - 1] };
        op.next = if i + 1 == n { P_NONE } else { blocks[i + 1] };
        bt_set_opaque(page, &op);

        // high key first on non-rightmost pages: first key of the
        // right neighbor
        if i + 1 < n {
            let hk = level_pages[i + 1][0].clone();
            page_add_item(page, &hk, None)
                .ok_or_else(|| DbError::Storage("bulk load high key overflow".into()))?;
        }
        for item in &level_pages[i] {
            page_add_item(page, item, None)
                .ok_or_else(|| DbError::Storage("bulk load item overflow".into()))?;
        }
    }
    for buf in bufs {
        bt_wrtbuf(db, env, index, buf)?;
    }
    Ok(blocks)
}

/// Point every child of the level just grouped at its future parent.
/// Parent blocks are the next `parents.len()` blocks to be allocated.
fn set_parent_hints(
    db: &Database,
    env: &mut Env,
    index: &Relation,
    child_blocks: &[BlockNumber],
    parents: &[Vec<Vec<u8>>],
) -> Result<()> {
    let next_block = index.nblocks()?;
    let mut child = 0usize;
    for (pi, pitems) in parents.iter().enumerate() {
        let parent_block = next_block + pi as BlockNumber;
        for _ in pitems {
            let cbuf = bt_getbuf(db, env, index, child_blocks[child], BT_WRITE)?;
            {
                let cpage = db.page_mut(env, cbuf);
                let mut op = bt_opaque(cpage);
                op.parent = parent_block;
                bt_set_opaque(cpage, &op);
            }
            bt_wrtbuf(db, env, index, cbuf)?;
            child += 1;
        }
    }
    Ok(())
}
