// End-to-end scenarios for the storage core: commit visibility, the
// update chain under different snapshots, writer coalescing, checksum
// tolerance, soft-commit promotion and checkpoint behavior.

use std::sync::atomic::Ordering;
use tempfile::TempDir;

use shaledb::common::{AttrDesc, Datum, TupleDesc, XidStatus};
use shaledb::heap;
use shaledb::transaction::snapshot::Snap;
use shaledb::{CorruptionPolicy, Database, DbConfig};

fn test_cfg(dir: &TempDir) -> DbConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut cfg = DbConfig::new(dir.path());
    cfg.buffers = 64;
    cfg.timeout_ms = 5;
    cfg.sync_timeout_ms = 100;
    cfg
}

fn two_col_desc() -> TupleDesc {
    TupleDesc::new(vec![AttrDesc::int4("k"), AttrDesc::text("v")])
}

fn row(k: i32, v: &str) -> (Vec<Datum>, Vec<bool>) {
    (vec![Datum::Int4(k), Datum::text(v)], vec![false, false])
}

fn collect_rows(
    db: &Database,
    env: &mut shaledb::Env,
    rel: &std::sync::Arc<shaledb::relation::Relation>,
    snap: &shaledb::transaction::snapshot::Snapshot,
) -> Vec<(i32, String)> {
    let mut out = Vec::new();
    let mut scan =
        heap::heap_beginscan(db, env, rel.clone(), Snap::Mvcc(snap), Vec::new()).unwrap();
    while let Some(tup) = heap::heap_getnext(db, env, &mut scan).unwrap() {
        let k = match tup.get_attr(1, &rel.desc) {
            Some(Datum::Int4(k)) => k,
            other => panic!("unexpected key {:?}", other),
        };
        let v = match tup.get_attr(2, &rel.desc) {
            Some(Datum::Text(v)) => String::from_utf8(v).unwrap(),
            other => panic!("unexpected value {:?}", other),
        };
        out.push((k, v));
    }
    heap::heap_endscan(db, env, &mut scan);
    out
}

#[test]
fn insert_and_hard_commit_visibility() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut a = db.create_env();
    db.begin_transaction(&mut a).unwrap();
    let rel = db.create_relation(&mut a, "t_vis", two_col_desc()).unwrap();
    let (values, nulls) = row(1, "one");
    db.insert(&mut a, &rel, &values, &nulls).unwrap();
    let a_xid = shaledb::transaction::current_xid(&a);
    db.commit_transaction(&mut a).unwrap();

    // a task started after the commit sees exactly that row
    let mut b = db.create_env();
    db.begin_transaction(&mut b).unwrap();
    assert_eq!(db.xid_status(&mut b, a_xid).unwrap(), XidStatus::Commit);

    let snap = db.query_snapshot(&mut b);
    let rows = collect_rows(&db, &mut b, &rel, &snap);
    assert_eq!(rows, vec![(1, "one".to_string())]);

    // the row carries the inserter's xid
    let mut scan =
        heap::heap_beginscan(&db, &mut b, rel.clone(), Snap::Mvcc(&snap), Vec::new()).unwrap();
    let tup = heap::heap_getnext(&db, &mut b, &mut scan).unwrap().unwrap();
    assert_eq!(tup.xmin(), a_xid);
    heap::heap_endscan(&db, &mut b, &mut scan);

    db.commit_transaction(&mut b).unwrap();
    assert_eq!(db.pool().check_leak(&b.buffers), 0);
    db.shutdown();
}

#[test]
fn update_chain_under_three_snapshots() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    // setup relation
    let mut setup = db.create_env();
    db.begin_transaction(&mut setup).unwrap();
    let rel = db.create_relation(&mut setup, "t_chain", two_col_desc()).unwrap();
    db.commit_transaction(&mut setup).unwrap();

    // A inserts R
    let mut a = db.create_env();
    db.begin_transaction(&mut a).unwrap();
    let (values, nulls) = row(7, "v1");
    db.insert(&mut a, &rel, &values, &nulls).unwrap();

    // snapshot taken before A commits
    let mut s1env = db.create_env();
    db.begin_transaction(&mut s1env).unwrap();
    let snap1 = db.query_snapshot(&mut s1env);

    db.commit_transaction(&mut a).unwrap();

    // snapshot after A, before B
    let mut s2env = db.create_env();
    db.begin_transaction(&mut s2env).unwrap();
    let snap2 = db.query_snapshot(&mut s2env);

    // B updates R
    let mut b = db.create_env();
    db.begin_transaction(&mut b).unwrap();
    let snapb = db.query_snapshot(&mut b);
    let rows = {
        let mut scan =
            heap::heap_beginscan(&db, &mut b, rel.clone(), Snap::Mvcc(&snapb), Vec::new())
                .unwrap();
        let tup = heap::heap_getnext(&db, &mut b, &mut scan).unwrap().unwrap();
        heap::heap_endscan(&db, &mut b, &mut scan);
        tup
    };
    let (nv, nn) = row(7, "v2");
    let (res, ntid) = db.update(&mut b, &rel, rows.self_tid, &nv, &nn).unwrap();
    assert_eq!(res, heap::HeapResult::Ok);
    assert!(ntid.is_some());
    db.commit_transaction(&mut b).unwrap();

    // snapshot after B
    let mut s3env = db.create_env();
    db.begin_transaction(&mut s3env).unwrap();
    let snap3 = db.query_snapshot(&mut s3env);

    let mut probe = db.create_env();
    db.begin_transaction(&mut probe).unwrap();

    assert!(collect_rows(&db, &mut probe, &rel, &snap1).is_empty());
    assert_eq!(
        collect_rows(&db, &mut probe, &rel, &snap2),
        vec![(7, "v1".to_string())]
    );
    assert_eq!(
        collect_rows(&db, &mut probe, &rel, &snap3),
        vec![(7, "v2".to_string())]
    );

    for env in [&mut probe, &mut s1env, &mut s2env, &mut s3env] {
        db.commit_transaction(env).unwrap();
    }
    db.shutdown();
}

#[test]
fn writer_coalesces_repeated_page_writes() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut env = db.create_env();
    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_coalesce", two_col_desc()).unwrap();
    db.commit_transaction(&mut env).unwrap();
    db.flush_all();

    let writes_before = db.disk().stats().writes.load(Ordering::Relaxed);
    let records_before = db.shadow().records_logged();

    // four writes to the same page in one transaction
    db.begin_transaction(&mut env).unwrap();
    for (i, v) in ["a", "b", "c", "d"].iter().enumerate() {
        let (values, nulls) = row(i as i32, v);
        db.insert(&mut env, &rel, &values, &nulls).unwrap();
    }
    db.commit_transaction(&mut env).unwrap();
    db.flush_all();

    let records = db.shadow().records_logged() - records_before;
    let writes = db.disk().stats().writes.load(Ordering::Relaxed) - writes_before;
    assert_eq!(records, 1, "exactly one shadow-log record for the page");
    assert_eq!(writes, 1, "exactly one home-file write for the page");
    db.shutdown();
}

#[test]
fn checksum_corruption_policies() {
    let dir = TempDir::new().unwrap();

    let rel_path;
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.create_relation(&mut env, "t_sum", two_col_desc()).unwrap();
        let (values, nulls) = row(1, "payload");
        db.insert(&mut env, &rel, &values, &nulls).unwrap();
        db.commit_transaction(&mut env).unwrap();
        db.flush_all();
        rel_path = db.disk().path_for(rel.file());
        db.shutdown();
    }

    // corrupt a byte inside the tuple area of block 0
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(&rel_path)
            .unwrap();
        f.seek(SeekFrom::Start(8000)).unwrap();
        f.write_all(&[0xAB]).unwrap();
        f.sync_all().unwrap();
    }

    // strict policy: the read fails, the scan yields nothing
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.open_relation("t_sum").unwrap();
        assert!(db.read_buffer(&mut env, &rel, 0).is_err());
        let snap = db.query_snapshot(&mut env);
        assert!(collect_rows(&db, &mut env, &rel, &snap).is_empty());
        db.commit_transaction(&mut env).unwrap();
        db.shutdown();
    }

    // IGNORE: the read succeeds with a re-initialized page
    {
        let mut cfg = test_cfg(&dir);
        cfg.heap_corruption = CorruptionPolicy::Ignore;
        let db = Database::open(cfg).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.open_relation("t_sum").unwrap();
        let buf = db.read_buffer(&mut env, &rel, 0).unwrap();
        assert!(shaledb::storage::page::page_is_empty(db.page(&env, buf)));
        db.release_buffer(&mut env, buf);
        let snap = db.query_snapshot(&mut env);
        assert!(collect_rows(&db, &mut env, &rel, &snap).is_empty());
        db.commit_transaction(&mut env).unwrap();
        db.shutdown();
    }
}

#[test]
fn soft_commit_is_promoted_to_durable_commit() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_cfg(&dir);
    cfg.commit_type = shaledb::CommitType::Soft;
    let db = Database::open(cfg).unwrap();

    let mut env = db.create_env();
    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_soft", two_col_desc()).unwrap();
    db.commit_transaction(&mut env).unwrap();

    db.begin_transaction(&mut env).unwrap();
    let (values, nulls) = row(5, "soft");
    db.insert(&mut env, &rel, &values, &nulls).unwrap();
    let xid = shaledb::transaction::current_xid(&env);
    db.commit_transaction(&mut env).unwrap();

    // commit returned without blocking; the status is at least soft
    db.begin_transaction(&mut env).unwrap();
    let status = db.xid_status(&mut env, xid).unwrap();
    assert!(status.is_committed(), "got {:?}", status);

    // a writer pass promotes it to a durable hard commit
    db.flush_all();
    let status = db.xid_status(&mut env, xid).unwrap();
    assert_eq!(status, XidStatus::Commit);

    // and the row is visible
    let snap = db.query_snapshot(&mut env);
    assert_eq!(
        collect_rows(&db, &mut env, &rel, &snap),
        vec![(5, "soft".to_string())]
    );
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn checkpoint_with_no_dirty_pages_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();
    db.flush_all();

    let writes_before = db.disk().stats().writes.load(Ordering::Relaxed);
    db.flush_all();
    db.flush_all();
    let writes_after = db.disk().stats().writes.load(Ordering::Relaxed);
    assert_eq!(writes_before, writes_after);
    db.shutdown();
}

#[test]
fn private_refcounts_return_to_zero() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut env = db.create_env();
    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_pins", two_col_desc()).unwrap();
    for i in 0..20 {
        let (values, nulls) = row(i, "x");
        db.insert(&mut env, &rel, &values, &nulls).unwrap();
    }
    db.commit_transaction(&mut env).unwrap();

    assert_eq!(db.pool().check_leak(&env.buffers), 0);
    assert_eq!(env.buffers.total_pins, 0);
    assert!(env.buffers.private_ref.iter().all(|&c| c == 0));
    db.shutdown();
}

#[test]
fn abort_leaves_rows_invisible() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut setup = db.create_env();
    db.begin_transaction(&mut setup).unwrap();
    let rel = db.create_relation(&mut setup, "t_abort", two_col_desc()).unwrap();
    db.commit_transaction(&mut setup).unwrap();

    let mut a = db.create_env();
    db.begin_transaction(&mut a).unwrap();
    let (values, nulls) = row(1, "doomed");
    db.insert(&mut a, &rel, &values, &nulls).unwrap();
    let xid = shaledb::transaction::current_xid(&a);
    db.abort_transaction(&mut a).unwrap();

    let mut b = db.create_env();
    db.begin_transaction(&mut b).unwrap();
    assert_eq!(db.xid_status(&mut b, xid).unwrap(), XidStatus::Abort);
    let snap = db.query_snapshot(&mut b);
    assert!(collect_rows(&db, &mut b, &rel, &snap).is_empty());
    db.commit_transaction(&mut b).unwrap();
    db.shutdown();
}

#[test]
fn catalogs_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.create_relation(&mut env, "t_persist", two_col_desc()).unwrap();
        db.create_index(&mut env, "t_persist_k_idx", &rel, vec![1], false)
            .unwrap();
        let (values, nulls) = row(9, "kept");
        db.insert(&mut env, &rel, &values, &nulls).unwrap();
        db.commit_transaction(&mut env).unwrap();
        db.shutdown();
    }
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.open_relation("t_persist").unwrap();
        assert_eq!(rel.desc.natts(), 2);
        let indexes = db.indexes_of(&rel);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "t_persist_k_idx");

        let snap = db.query_snapshot(&mut env);
        assert_eq!(
            collect_rows(&db, &mut env, &rel, &snap),
            vec![(9, "kept".to_string())]
        );
        db.commit_transaction(&mut env).unwrap();
        db.shutdown();
    }
}
