// Cross-task behavior: REF_EXCLUSIVE waits out page accessors, hard
// commits block until the writer logs them, and a scanner racing a
// file extension never sees a partial view.

use std::time::Duration;
use tempfile::TempDir;

use shaledb::buffer::LockMode;
use shaledb::common::{AttrDesc, Datum, TupleDesc};
use shaledb::heap;
use shaledb::transaction::snapshot::Snap;
use shaledb::{Database, DbConfig};

fn test_cfg(dir: &TempDir) -> DbConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut cfg = DbConfig::new(dir.path());
    cfg.buffers = 64;
    cfg.timeout_ms = 5;
    cfg.sync_timeout_ms = 100;
    cfg
}

fn desc() -> TupleDesc {
    TupleDesc::new(vec![AttrDesc::int4("k"), AttrDesc::text("v")])
}

#[test]
fn ref_exclusive_waits_for_page_accessors() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut env = db.create_env();
    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_refx", desc()).unwrap();
    db.insert(
        &mut env,
        &rel,
        &[Datum::Int4(1), Datum::text("x")],
        &[false, false],
    )
    .unwrap();
    db.commit_transaction(&mut env).unwrap();

    // this task keeps a page-access pin on block 0
    db.begin_transaction(&mut env).unwrap();
    let held = db.read_buffer(&mut env, &rel, 0).unwrap();

    let db2 = db.clone();
    let rel2 = rel.clone();
    let contender = std::thread::spawn(move || {
        let mut env2 = db2.create_env();
        db2.begin_transaction(&mut env2).unwrap();
        let buf = db2.read_buffer(&mut env2, &rel2, 0).unwrap();
        // blocks until the holder lets go of its page access
        db2.lock_page(&mut env2, buf, LockMode::RefExclusive);
        db2.unlock_page(&mut env2, buf);
        db2.release_buffer(&mut env2, buf);
        db2.commit_transaction(&mut env2).unwrap();
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !contender.is_finished(),
        "REF_EXCLUSIVE must wait for the page accessor"
    );

    db.release_buffer(&mut env, held);
    contender.join().unwrap();
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn concurrent_commits_from_many_tasks() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut env = db.create_env();
    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_many", desc()).unwrap();
    db.commit_transaction(&mut env).unwrap();

    let mut handles = Vec::new();
    for t in 0..4 {
        let db = db.clone();
        let rel = rel.clone();
        handles.push(std::thread::spawn(move || {
            let mut env = db.create_env();
            for i in 0..5 {
                db.begin_transaction(&mut env).unwrap();
                db.insert(
                    &mut env,
                    &rel,
                    &[Datum::Int4(t * 100 + i), Datum::text("w")],
                    &[false, false],
                )
                .unwrap();
                db.commit_transaction(&mut env).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    db.begin_transaction(&mut env).unwrap();
    let snap = db.query_snapshot(&mut env);
    let mut count = 0;
    let mut scan =
        heap::heap_beginscan(&db, &mut env, rel.clone(), Snap::Mvcc(&snap), Vec::new()).unwrap();
    while heap::heap_getnext(&db, &mut env, &mut scan).unwrap().is_some() {
        count += 1;
    }
    heap::heap_endscan(&db, &mut env, &mut scan);
    assert_eq!(count, 20);
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}

#[test]
fn scan_during_extension_sees_consistent_view() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(test_cfg(&dir)).unwrap();

    let mut env = db.create_env();
    db.begin_transaction(&mut env).unwrap();
    let rel = db.create_relation(&mut env, "t_ext", desc()).unwrap();
    for i in 0..3 {
        db.insert(
            &mut env,
            &rel,
            &[Datum::Int4(i), Datum::text("old")],
            &[false, false],
        )
        .unwrap();
    }
    db.commit_transaction(&mut env).unwrap();

    db.begin_transaction(&mut env).unwrap();
    let snap = db.query_snapshot(&mut env);
    let mut scan =
        heap::heap_beginscan(&db, &mut env, rel.clone(), Snap::Mvcc(&snap), Vec::new()).unwrap();
    let first = heap::heap_getnext(&db, &mut env, &mut scan).unwrap();
    assert!(first.is_some());

    // another task extends the relation mid-scan
    {
        let db2 = db.clone();
        let rel2 = rel.clone();
        let t = std::thread::spawn(move || {
            let mut env2 = db2.create_env();
            db2.begin_transaction(&mut env2).unwrap();
            // enough rows to spill onto a new block
            for i in 0..400 {
                db2.insert(
                    &mut env2,
                    &rel2,
                    &[Datum::Int4(1000 + i), Datum::text("new-block-filler-text")],
                    &[false, false],
                )
                .unwrap();
            }
            db2.commit_transaction(&mut env2).unwrap();
        });
        t.join().unwrap();
    }
    assert!(rel.nblocks().unwrap() > 1);

    // the scan completes over its original view: all three old rows,
    // none of the concurrent ones (snapshot), no partial pages
    let mut seen = 1;
    while let Some(tup) = heap::heap_getnext(&db, &mut env, &mut scan).unwrap() {
        let k = match tup.get_attr(1, &rel.desc) {
            Some(Datum::Int4(k)) => k,
            _ => panic!("bad key"),
        };
        assert!(k < 1000, "snapshot must hide concurrent inserts");
        seen += 1;
    }
    heap::heap_endscan(&db, &mut env, &mut scan);
    assert_eq!(seen, 3);
    db.commit_transaction(&mut env).unwrap();
    db.shutdown();
}
