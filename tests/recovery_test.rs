// Crash recovery: a committed shadow log whose home-file writes never
// happened is replayed at the next startup, after which the database
// state is equivalent to a clean shutdown.

use tempfile::TempDir;

use shaledb::common::{AttrDesc, Datum, RelKind, TupleDesc};
use shaledb::heap;
use shaledb::storage::checksum::page_insert_checksum;
use shaledb::storage::disk::{DiskManager, RelFileId};
use shaledb::storage::page::BLCKSZ;
use shaledb::storage::shadow::{ShadowLog, ShadowRecord};
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
fn shadow_log_replay_restores_lost_home_writes() {
    let dir = TempDir::new().unwrap();

    // phase 1: build a database with one committed row, shut down
    // cleanly, and remember where the heap lives
    let (rel_oid, image_after_commit) = {
        let db = Database::open(test_cfg(&dir)).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.create_relation(&mut env, "t_crash", desc()).unwrap();
        db.insert(
            &mut env,
            &rel,
            &[Datum::Int4(1), Datum::text("committed")],
            &[false, false],
        )
        .unwrap();
        db.commit_transaction(&mut env).unwrap();
        db.flush_all();
        let oid = rel.id;
        db.shutdown();

        let disk = DiskManager::new(dir.path()).unwrap();
        let mut image = vec![0u8; BLCKSZ];
        disk.read(RelFileId::new(1, oid), 0, &mut image).unwrap();
        (oid, image)
    };

    // phase 2: simulate the crash window. The shadow log holds the
    // committed page image; the home file has been clobbered as if its
    // write never made it.
    {
        let disk = DiskManager::new(dir.path()).unwrap();
        let log = ShadowLog::new(dir.path());
        log.beginlog();
        log.log(&ShadowRecord {
            db: 1,
            rel: rel_oid,
            block: 0,
            kind: RelKind::Heap.as_u8(),
            db_name: "system".into(),
            rel_name: "t_crash".into(),
            image: image_after_commit.clone(),
        })
        .unwrap();
        log.commitlog().unwrap();

        let mut torn = vec![0u8; BLCKSZ];
        torn[..16].copy_from_slice(&image_after_commit[..16]);
        page_insert_checksum(&mut torn);
        disk.write(RelFileId::new(1, rel_oid), 0, &torn).unwrap();
        disk.sync(RelFileId::new(1, rel_oid)).unwrap();
    }

    // phase 3: restart. Replay must reapply the shadow image before
    // user work begins.
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        assert!(
            db.recovered_pages().iter().any(|p| p.rel == rel_oid),
            "the heap page must be on the recovered list"
        );

        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        let rel = db.open_relation("t_crash").unwrap();
        let snap = db.query_snapshot(&mut env);
        let mut scan =
            heap::heap_beginscan(&db, &mut env, rel.clone(), Snap::Mvcc(&snap), Vec::new())
                .unwrap();
        let tup = heap::heap_getnext(&db, &mut env, &mut scan)
            .unwrap()
            .expect("the committed row must survive the crash");
        assert_eq!(tup.get_attr(1, &rel.desc), Some(Datum::Int4(1)));
        assert_eq!(
            tup.get_attr(2, &rel.desc),
            Some(Datum::text("committed"))
        );
        assert!(heap::heap_getnext(&db, &mut env, &mut scan).unwrap().is_none());
        heap::heap_endscan(&db, &mut env, &mut scan);
        db.commit_transaction(&mut env).unwrap();

        // the log is consumed
        let len = std::fs::metadata(dir.path().join("1").join("shadow.log"))
            .unwrap()
            .len();
        assert_eq!(len, 0);
        db.shutdown();
    }
}

#[test]
fn startup_with_clean_logs_recovers_nothing() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        let mut env = db.create_env();
        db.begin_transaction(&mut env).unwrap();
        db.create_relation(&mut env, "t_clean", desc()).unwrap();
        db.commit_transaction(&mut env).unwrap();
        db.shutdown();
    }
    {
        let db = Database::open(test_cfg(&dir)).unwrap();
        assert!(db.recovered_pages().is_empty());
        db.shutdown();
    }
}
