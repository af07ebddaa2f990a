// Bulk deletion of index entries by heap TID.
//
// One pass over the leaf chain. Each leaf is claimed with
// REF_EXCLUSIVE, which waits out every reader still dereferencing the
// page, so no stopped scan can be left pointing at an item we remove
// from under it. An empty TID set is a no-op: no locks taken, no pages
// visited.

use tracing::debug;

use crate::buffer::LockMode;
use crate::common::ItemPointer;
use crate::db::Database;
use crate::env::Env;
use crate::error::Result;
use crate::relation::Relation;
use crate::storage::page::{
    page_get_item, page_index_tuple_delete, page_item_id, page_max_offset,
};

use super::item::item_get_tid;
use super::page::{bt_opaque, P_NONE};
use super::{bt_leftmost_leaf, bt_relbuf, bt_wrtbuf};

/// Delete every index entry whose heap TID appears in `tids`. Returns
/// the number of entries removed.
pub fn btbulkdelete(
    db: &Database,
    env: &mut Env,
    rel: &Relation,
    tids: &mut Vec<ItemPointer>,
) -> Result<u64> {
    if tids.is_empty() {
        return Ok(0);
    }
    tids.sort_unstable();

    let mut removed: u64 = 0;
    let mut block = bt_leftmost_leaf(db, env, rel)?;

    while block != P_NONE {
        env.check_for_cancel()?;

        let buf = db.read_buffer(env, rel, block)?;
        db.lock_page(env, buf, LockMode::RefExclusive);

        let mut dirtied = false;
        let next;
        {
            let page = db.page_mut(env, buf);
            let op = bt_opaque(page);
            next = op.next;
            let mut off = op.first_data_key();
            while off <= page_max_offset(page) {
                let lp = page_item_id(page, off);
                if !lp.is_used() {
                    off += 1;
                    continue;
                }
                let tid = item_get_tid(page_get_item(page, off));
                if tids.binary_search(&tid).is_ok() {
                    page_index_tuple_delete(page, off);
                    removed += 1;
                    dirtied = true;
                    // the next item slid into this offset
                } else {
                    off += 1;
                }
            }
        }

        if dirtied {
            bt_wrtbuf(db, env, rel, buf)?;
        } else {
            bt_relbuf(db, env, buf);
        }
        block = next;
    }

    debug!(rel = %rel.name, removed, "btree bulk delete");
    Ok(removed)
}
