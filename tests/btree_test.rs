// B-tree behavior through the public surface: ordered scans across
// page splits, equality lookups, bulk delete, and scan restoration
// after the anchor entry disappears.

use tempfile::TempDir;

use shaledb::buffer::LockMode;
use shaledb::common::{AttrDesc, Datum, ItemPointer, ScanKey, SkOp, TupleDesc};
use shaledb::index::btree;
use shaledb::index::btree::scan::{btbeginscan, btendscan, btgettuple};
use shaledb::storage::page as pg;
use shaledb::{Database, DbConfig};

fn test_cfg(dir: &TempDir) -> DbConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut cfg = DbConfig::new(dir.path());
    cfg.buffers = 128;
    cfg.timeout_ms = 5;
    cfg.sync_timeout_ms = 100;
    cfg
}

fn desc() -> TupleDesc {
    TupleDesc::new(vec![AttrDesc::int4("k"), AttrDesc::text("v")])
}

#[test]
fn ordered_scan_across_splits() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    let mut env = db.create_env();

    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_split", desc()).unwrap();
    // half the keys before the build, half after, descending so the
    // build path sorts and the insert path splits
    for k in (300..600).rev() {
        db.insert(
            &mut env,
            &rel,
            &[Datum::Int4(k), Datum::text("pre")],
            &[false, false],
        )
        .unwrap();
    }
    let index = db
        .create_index(&mut env, "t_split_idx", &rel, vec![1], false)
        .unwrap();
    for k in (0..300).rev() {
        db.insert(
            &mut env,
            &rel,
            &[Datum::Int4(k), Datum::text("post")],
            &[false, false],
        )
        .unwrap();
    }
    db.commit_transaction(&mut env).unwrap();

    db.begin_transaction(&mut env).unwrap();
    let mut scan = btbeginscan(index.clone(), Vec::new());
    let mut keys = Vec::new();
    while let Some(tid) = btgettuple(&db, &mut env, &mut scan).unwrap() {
        assert!(tid.is_valid());
        keys.push(tid);
    }
    btendscan(&db, &mut env, &mut scan);
    assert_eq!(keys.len(), 600);

    // the index spans more than a single leaf
    assert!(index.nblocks().unwrap() > 2);
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn equality_lookup_finds_one_tid() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    let mut env = db.create_env();

    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_eq", desc()).unwrap();
    let index = db
        .create_index(&mut env, "t_eq_idx", &rel, vec![1], true)
        .unwrap();
    let mut wanted = ItemPointer::invalid();
    for k in 0..100 {
        let tid = db
            .insert(
                &mut env,
                &rel,
                &[Datum::Int4(k), Datum::text("x")],
                &[false, false],
            )
            .unwrap();
        if k == 42 {
            wanted = tid;
        }
    }
    db.commit_transaction(&mut env).unwrap();

    db.begin_transaction(&mut env).unwrap();
    let keys = vec![ScanKey::new(1, SkOp::Eq, Datum::Int4(42))];
    let mut scan = btbeginscan(index, keys);
    let found = btgettuple(&db, &mut env, &mut scan).unwrap();
    assert_eq!(found, Some(wanted));
    assert_eq!(btgettuple(&db, &mut env, &mut scan).unwrap(), None);
    btendscan(&db, &mut env, &mut scan);
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn unique_index_rejects_live_duplicate() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    let mut env = db.create_env();

    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_uni", desc()).unwrap();
    db.create_index(&mut env, "t_uni_idx", &rel, vec![1], true)
        .unwrap();
    db.insert(
        &mut env,
        &rel,
        &[Datum::Int4(1), Datum::text("first")],
        &[false, false],
    )
    .unwrap();
    let err = db.insert(
        &mut env,
        &rel,
        &[Datum::Int4(1), Datum::text("second")],
        &[false, false],
    );
    assert!(err.is_err());
    db.abort_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn empty_bulkdelete_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    let mut env = db.create_env();

    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_bd", desc()).unwrap();
    let index = db
        .create_index(&mut env, "t_bd_idx", &rel, vec![1], false)
        .unwrap();
    for k in 0..10 {
        db.insert(
            &mut env,
            &rel,
            &[Datum::Int4(k), Datum::text("x")],
            &[false, false],
        )
        .unwrap();
    }

    let mut empty: Vec<ItemPointer> = Vec::new();
    let removed = btree::bulkdelete::btbulkdelete(&db, &mut env, &index, &mut empty).unwrap();
    assert_eq!(removed, 0);

    let mut some = vec![ItemPointer::new(0, 1), ItemPointer::new(0, 2)];
    let removed = btree::bulkdelete::btbulkdelete(&db, &mut env, &index, &mut some).unwrap();
    assert_eq!(removed, 2);
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

/// Scenario: a stopped scan's anchor entry is deleted; on resumption
/// the scan walks to the first surviving key past its stop point.
#[test]
fn scan_restores_past_deleted_anchor() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    let mut env = db.create_env();

    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_rest", desc()).unwrap();
    let index = db
        .create_index(&mut env, "t_rest_idx", &rel, vec![1], false)
        .unwrap();
    let mut tids = Vec::new();
    for k in 0..10 {
        tids.push(
            db.insert(
                &mut env,
                &rel,
                &[Datum::Int4(k), Datum::text("x")],
                &[false, false],
            )
            .unwrap(),
        );
    }
    db.commit_transaction(&mut env).unwrap();

    db.begin_transaction(&mut env).unwrap();
    let mut scan = btbeginscan(index.clone(), Vec::new());
    // stop on key 0
    let first = btgettuple(&db, &mut env, &mut scan).unwrap().unwrap();
    assert_eq!(first, tids[0]);

    // excise the anchor entry and its successor directly, the way a
    // bulk-deleter running from another page would have
    let victims = [tids[0], tids[1]];
    let nblocks = index.nblocks().unwrap();
    for block in 1..nblocks {
        let buf = db.read_buffer(&mut env, &index, block).unwrap();
        db.lock_page(&mut env, buf, LockMode::Exclusive);
        let page = db.page_mut(&env, buf);
        let op = btree::page::bt_opaque(page);
        if op.is_leaf() && !op.is_reaped() {
            let mut off = op.first_data_key();
            while off <= pg::page_max_offset(page) {
                let item = pg::page_get_item(page, off);
                let tid = btree::item::item_get_tid(item);
                if victims.contains(&tid) {
                    pg::page_index_tuple_delete(page, off);
                } else {
                    off += 1;
                }
            }
        }
        db.unlock_page(&mut env, buf);
        db.release_buffer(&mut env, buf);
    }

    // resumption skips to key 2
    let next = btgettuple(&db, &mut env, &mut scan).unwrap().unwrap();
    assert_eq!(next, tids[2]);

    // and the rest of the scan is intact
    let mut rest = Vec::new();
    while let Some(tid) = btgettuple(&db, &mut env, &mut scan).unwrap() {
        rest.push(tid);
    }
    assert_eq!(rest, tids[3..].to_vec());
    btendscan(&db, &mut env, &mut scan);
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn recover_pass_reaps_new_pages() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    let mut env = db.create_env();

    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_rec", desc()).unwrap();
    let index = db
        .create_index(&mut env, "t_rec_idx", &rel, vec![1], false)
        .unwrap();
    for k in 0..5 {
        db.insert(
            &mut env,
            &rel,
            &[Datum::Int4(k), Datum::text("x")],
            &[false, false],
        )
        .unwrap();
    }
    // a block extended but never formatted, as a crash would leave it
    let zero = vec![0u8; pg::BLCKSZ];
    let orphan = index.smgr_extend(&zero, 1).unwrap() - 1;
    let reaped =
        btree::recover::btrecoverpage(&db, &mut env, &index, Some(&rel), orphan).unwrap();
    assert_eq!(reaped, Some(orphan));
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}
