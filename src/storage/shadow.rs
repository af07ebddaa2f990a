// Per-database shadow log.
//
// Before DBWriter updates any home file, the full images of every page
// dirtied by the group are appended here and fsynced. The log is
// truncated once all home writes of the group have reached disk, and
// replayed at startup for any database whose log is non-empty. A record
// carries the blind names so replay can run without a catalog.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::common::{BlockNumber, Oid};
use crate::error::Result;
use crate::storage::disk::{DiskManager, RelFileId};
use crate::storage::page::BLCKSZ;

#[derive(Debug, Serialize, Deserialize)]
pub struct ShadowRecord {
    pub db: Oid,
    pub rel: Oid,
    pub block: BlockNumber,
    pub kind: u8,
    pub db_name: String,
    pub rel_name: String,
    pub image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPage {
    pub db: Oid,
    pub rel: Oid,
    pub block: BlockNumber,
    pub kind: u8,
    pub db_name: String,
    pub rel_name: String,
}

pub struct ShadowLog {
    root: PathBuf,
    batch: Mutex<HashMap<Oid, BufWriter<File>>>,
    records_logged: AtomicU64,
}

impl ShadowLog {
    pub fn new<P: Into<PathBuf>>(root: P) -> ShadowLog {
        ShadowLog {
            root: root.into(),
            batch: Mutex::new(HashMap::new()),
            records_logged: AtomicU64::new(0),
        }
    }

    fn log_path(&self, db: Oid) -> PathBuf {
        self.root.join(db.to_string()).join("shadow.log")
    }

    /// Total records appended over the log's lifetime.
    pub fn records_logged(&self) -> u64 {
        self.records_logged.load(Ordering::Relaxed)
    }

    /// Open a logging batch. Writers are opened lazily, one per
    /// database touched.
    pub fn beginlog(&self) {
        let mut batch = self.batch.lock();
        debug_assert!(batch.is_empty(), "overlapping shadow log batches");
        batch.clear();
    }

    pub fn log(&self, rec: &ShadowRecord) -> Result<()> {
        debug_assert_eq!(rec.image.len(), BLCKSZ);
        let mut batch = self.batch.lock();
        if !batch.contains_key(&rec.db) {
            fs::create_dir_all(self.root.join(rec.db.to_string()))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(rec.db))?;
            batch.insert(rec.db, BufWriter::new(file));
        }
        let w = batch.get_mut(&rec.db).unwrap();
        bincode::serde::encode_into_std_write(rec, w, bincode::config::standard())?;
        self.records_logged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and fsync every log touched by the batch. This is the
    /// durability point that must precede any home-file write.
    pub fn commitlog(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        for (_, w) in batch.iter_mut() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        batch.clear();
        Ok(())
    }

    /// Truncate every shadow log. Called after all home writes of the
    /// group have been fsynced.
    pub fn expirelogs(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path().join("shadow.log");
            if path.exists() {
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(0)?;
                f.sync_all()?;
            }
        }
        Ok(())
    }

    /// Startup recovery: reapply every complete record from every
    /// non-empty shadow log, then truncate the logs. A torn tail record
    /// (crash mid-append) is discarded.
    pub fn replaylogs(&self, disk: &DiskManager) -> Result<Vec<RecoveredPage>> {
        let mut recovered = Vec::new();
        if !self.root.exists() {
            return Ok(recovered);
        }
        let zero = vec![0u8; BLCKSZ];
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let db: Oid = match entry.file_name().to_string_lossy().parse() {
                Ok(oid) => oid,
                Err(_) => continue,
            };
            let path = self.log_path(db);
            let len = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(_) => continue,
            };
            if len == 0 {
                continue;
            }
            info!(db, bytes = len, "replaying shadow log");
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                let rec: ShadowRecord = match bincode::serde::decode_from_std_read(
                    &mut reader,
                    bincode::config::standard(),
                ) {
                    Ok(rec) => rec,
                    Err(bincode::error::DecodeError::Io { inner, .. })
                        if inner.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    Err(e) => {
                        warn!(db, error = %e, "torn shadow log tail, discarding remainder");
                        break;
                    }
                };
                let id = RelFileId::new(rec.db, rec.rel);
                let mut nblocks = disk.nblocks(id)?;
                while nblocks <= rec.block {
                    nblocks = disk.extend(id, &zero, 1)?;
                }
                disk.write(id, rec.block, &rec.image)?;
                recovered.push(RecoveredPage {
                    db: rec.db,
                    rel: rec.rel,
                    block: rec.block,
                    kind: rec.kind,
                    db_name: rec.db_name.clone(),
                    rel_name: rec.rel_name.clone(),
                });
            }
            // sync everything replayed for this database before
            // forgetting the log
            for page in &recovered {
                if page.db == db {
                    disk.sync(RelFileId::new(page.db, page.rel))?;
                }
            }
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(0)?;
            f.sync_all()?;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DiskManager, ShadowLog) {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::new(dir.path()).unwrap();
        let log = ShadowLog::new(dir.path());
        (dir, disk, log)
    }

    fn record(db: Oid, rel: Oid, block: BlockNumber, fill: u8) -> ShadowRecord {
        ShadowRecord {
            db,
            rel,
            block,
            kind: b'r',
            db_name: "system".into(),
            rel_name: "t".into(),
            image: vec![fill; BLCKSZ],
        }
    }

    #[test]
    fn log_commit_replay_round_trip() {
        let (_d, disk, log) = setup();
        log.beginlog();
        log.log(&record(1, 50, 0, 0x11)).unwrap();
        log.log(&record(1, 50, 2, 0x22)).unwrap();
        log.commitlog().unwrap();

        let recovered = log.replaylogs(&disk).unwrap();
        assert_eq!(recovered.len(), 2);

        let id = RelFileId::new(1, 50);
        assert_eq!(disk.nblocks(id).unwrap(), 3);
        let mut out = vec![0u8; BLCKSZ];
        disk.read(id, 0, &mut out).unwrap();
        assert_eq!(out[0], 0x11);
        disk.read(id, 2, &mut out).unwrap();
        assert_eq!(out[0], 0x22);
        // block 1 was never logged, replay extended it as zeros
        disk.read(id, 1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn replay_truncates_the_log() {
        let (dir, disk, log) = setup();
        log.beginlog();
        log.log(&record(1, 51, 0, 0x33)).unwrap();
        log.commitlog().unwrap();
        log.replaylogs(&disk).unwrap();

        let len = fs::metadata(dir.path().join("1").join("shadow.log"))
            .unwrap()
            .len();
        assert_eq!(len, 0);
        // second replay is a no-op
        assert!(log.replaylogs(&disk).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_discarded() {
        let (dir, disk, log) = setup();
        log.beginlog();
        log.log(&record(1, 52, 0, 0x44)).unwrap();
        log.commitlog().unwrap();

        // simulate a crash mid-append: garbage half-record at the tail
        let path = dir.path().join("1").join("shadow.log");
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xFF, 0x01, 0x02]).unwrap();
        drop(f);

        let recovered = log.replaylogs(&disk).unwrap();
        assert_eq!(recovered.len(), 1);
        let mut out = vec![0u8; BLCKSZ];
        disk.read(RelFileId::new(1, 52), 0, &mut out).unwrap();
        assert_eq!(out[0], 0x44);
    }

    #[test]
    fn expire_clears_without_replay() {
        let (dir, _disk, log) = setup();
        log.beginlog();
        log.log(&record(1, 53, 0, 0x55)).unwrap();
        log.commitlog().unwrap();
        log.expirelogs().unwrap();
        let len = fs::metadata(dir.path().join("1").join("shadow.log"))
            .unwrap()
            .len();
        assert_eq!(len, 0);
    }
}
