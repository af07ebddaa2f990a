// B-tree access method (Lehman-Yao).
//
// Descents hold no lock while acquiring the next level; every traversal
// compensates for concurrent splits by moving right. Multi-page lock
// holds only ever extend rightward (sibling fixes) or upward (parent
// re-insertion after a split), which keeps the lock graph acyclic.

pub mod build;
pub mod bulkdelete;
pub mod insert;
pub mod item;
pub mod page;
pub mod recover;
pub mod scan;

use std::cmp::Ordering;

use crate::buffer::LockMode;
use crate::common::{BlockNumber, FrameId, OffsetNumber, P_NEW};
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::relation::Relation;
use crate::storage::page::{page_item_id, page_max_offset};

use item::{cmp_keys, item_get_downlink, item_key, IndexKey};
use page::{
    bt_meta_init, bt_opaque, bt_page_init, bt_read_meta, bt_write_meta, BtMeta, BtPageOpaque,
    BTP_LEAF, BTP_ROOT, BTREE_MAGIC, BTREE_METAPAGE, BTREE_VERSION, P_NONE,
};

pub const BT_READ: LockMode = LockMode::Share;
pub const BT_WRITE: LockMode = LockMode::Exclusive;

/// Read and lock a B-tree page. `P_NEW` extends the relation; the new
/// page comes back write-locked and unformatted.
pub fn bt_getbuf(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    block: BlockNumber,
    mode: LockMode,
) -> Result<FrameId> {
    if block == P_NEW {
        let buf = db.read_buffer(env, rel, P_NEW)?;
        db.lock_page(env, buf, BT_WRITE);
        return Ok(buf);
    }
    let buf = db.read_buffer(env, rel, block)?;
    db.lock_page(env, buf, mode);
    Ok(buf)
}

/// Unlock and unpin without writing.
pub fn bt_relbuf(db: &Database, env: &mut Env, buf: FrameId) {
    db.unlock_page(env, buf);
    db.release_buffer(env, buf);
}

/// Unlock and hand the dirtied page to the writer.
pub fn bt_wrtbuf(db: &Database, env: &mut Env, rel: &Relation, buf: FrameId) -> Result<()> {
    db.unlock_page(env, buf);
    env.buffers.did_write = true;
    if !rel.xact_only {
        env.transaction.shared_buffer_changed = true;
    }
    db.write_buffer(env, rel, buf)
}

/// Create the meta page of an empty index.
pub fn bt_metapinit(db: &Database, env: &mut Env, rel: &Relation) -> Result<()> {
    if rel.nblocks()? != 0 {
        return Err(DbError::Catalog(format!(
            "index {} already contains data",
            rel.name
        )));
    }
    let buf = bt_getbuf(db, env, rel, P_NEW, BT_WRITE)?;
    bt_meta_init(db.page_mut(env, buf));
    bt_wrtbuf(db, env, rel, buf)
}

/// Current root, creating an empty root leaf on first use.
pub fn bt_getroot(db: &Database, env: &mut Env, rel: &Relation) -> Result<BlockNumber> {
    let mbuf = bt_getbuf(db, env, rel, BTREE_METAPAGE, BT_READ)?;
    let meta = bt_read_meta(db.page(env, mbuf));
    if meta.magic != BTREE_MAGIC || meta.version != BTREE_VERSION {
        bt_relbuf(db, env, mbuf);
        return Err(DbError::Corrupted(format!(
            "bad btree meta page in {}",
            rel.name
        )));
    }
    if meta.root != P_NONE {
        bt_relbuf(db, env, mbuf);
        return Ok(meta.root);
    }
    // no root yet: upgrade and build one
    db.unlock_page(env, mbuf);
    db.lock_page(env, mbuf, BT_WRITE);
    let meta = bt_read_meta(db.page(env, mbuf));
    if meta.root != P_NONE {
        bt_relbuf(db, env, mbuf);
        return Ok(meta.root);
    }
    let rbuf = bt_getbuf(db, env, rel, P_NEW, BT_WRITE)?;
    let rblock = db.block_of(env, rbuf);
    bt_page_init(
        db.page_mut(env, rbuf),
        BTP_LEAF | BTP_ROOT,
        BTREE_METAPAGE,
    );
    bt_write_meta(
        db.page_mut(env, mbuf),
        &BtMeta {
            magic: BTREE_MAGIC,
            version: BTREE_VERSION,
            root: rblock,
            level: 1,
        },
    );
    bt_wrtbuf(db, env, rel, rbuf)?;
    bt_wrtbuf(db, env, rel, mbuf)?;
    Ok(rblock)
}

/// Decode the key of the page's high key (offset 1 on non-rightmost
/// pages).
pub fn high_key(db: &Database, env: &mut Env, rel: &Relation, buf: FrameId) -> Option<IndexKey> {
    let page = db.page(env, buf);
    let op = bt_opaque(page);
    if op.is_rightmost() {
        return None;
    }
    Some(item_key(&rel.desc, crate::storage::page::page_get_item(page, 1)))
}

/// Move right while the search key exceeds the page's high key,
/// lock-coupling onto each successor in `mode`.
pub fn bt_moveright(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    mut buf: FrameId,
    mut block: BlockNumber,
    key: &IndexKey,
    mode: LockMode,
) -> Result<(FrameId, BlockNumber)> {
    loop {
        let op = bt_opaque(db.page(env, buf));
        if op.is_rightmost() {
            return Ok((buf, block));
        }
        let hk = item_key(
            &rel.desc,
            crate::storage::page::page_get_item(db.page(env, buf), 1),
        );
        if cmp_keys(key, &hk) != Ordering::Greater {
            return Ok((buf, block));
        }
        let next = op.next;
        let nbuf = bt_getbuf(db, env, rel, next, mode)?;
        bt_relbuf(db, env, buf);
        buf = nbuf;
        block = next;
    }
}

/// Child slot for a search key on an internal page: the last data item
/// whose key does not exceed it. The first data item acts as minus
/// infinity.
pub fn bt_binsrch_internal(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    buf: FrameId,
    key: &IndexKey,
) -> OffsetNumber {
    let page = db.page(env, buf);
    let op = bt_opaque(page);
    let first = op.first_data_key();
    let maxoff = page_max_offset(page);
    let mut result = first;
    let mut off = first + 1;
    while off <= maxoff {
        let lp = page_item_id(page, off);
        if !lp.is_used() {
            off += 1;
            continue;
        }
        let k = item_key(&rel.desc, crate::storage::page::page_get_item(page, off));
        if cmp_keys(&k, key) != Ordering::Greater {
            result = off;
            off += 1;
        } else {
            break;
        }
    }
    result
}

/// Insert position on a page: after every item that does not exceed
/// the key. On internal pages the first data item is never displaced.
pub fn bt_find_insert_off(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    buf: FrameId,
    key: &IndexKey,
) -> OffsetNumber {
    let page = db.page(env, buf);
    let op = bt_opaque(page);
    let first = op.first_data_key();
    let start = if op.is_leaf() { first } else { first + 1 };
    let maxoff = page_max_offset(page);
    let mut off = start;
    while off <= maxoff {
        let k = item_key(&rel.desc, crate::storage::page::page_get_item(page, off));
        if cmp_keys(&k, key) != Ordering::Greater {
            off += 1;
        } else {
            break;
        }
    }
    off
}

/// Descend from the root to the leaf that covers `key`, returning it
/// share-locked and pinned.
pub fn bt_search(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    key: &IndexKey,
) -> Result<(FrameId, BlockNumber)> {
    let mut block = bt_getroot(db, env, rel)?;
    loop {
        let buf = bt_getbuf(db, env, rel, block, BT_READ)?;
        let (buf, blk) = bt_moveright(db, env, rel, buf, block, key, BT_READ)?;
        block = blk;
        let op = bt_opaque(db.page(env, buf));
        if op.is_leaf() {
            return Ok((buf, block));
        }
        let off = bt_binsrch_internal(db, env, rel, buf, key);
        let child =
            item_get_downlink(crate::storage::page::page_get_item(db.page(env, buf), off));
        bt_relbuf(db, env, buf);
        block = child;
    }
}

/// Leftmost leaf of the tree.
pub fn bt_leftmost_leaf(db: &Database, env: &mut Env, rel: &Relation) -> Result<BlockNumber> {
    let mut block = bt_getroot(db, env, rel)?;
    loop {
        let buf = bt_getbuf(db, env, rel, block, BT_READ)?;
        let page = db.page(env, buf);
        let op = bt_opaque(page);
        if op.is_leaf() {
            bt_relbuf(db, env, buf);
            return Ok(block);
        }
        let first = op.first_data_key();
        let child = item_get_downlink(crate::storage::page::page_get_item(page, first));
        bt_relbuf(db, env, buf);
        block = child;
    }
}

/// True when the page holds no data items.
pub fn bt_page_is_empty(page: &[u8], op: &BtPageOpaque) -> bool {
    page_max_offset(page) < op.first_data_key()
}
