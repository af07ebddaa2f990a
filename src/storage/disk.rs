// Disk manager: block-granular I/O over one file per relation.
//
// Relation files live at `<root>/<dbid>/<relid>.rel`. Open handles are
// cached and closed on request (the writer's path-cache idle sweep).
// All failures propagate as errors; the buffer layer is responsible for
// marking the affected frame with its terminal IO_ERROR state.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::common::{BlockNumber, Oid};
use crate::error::{DbError, Result};
use crate::storage::page::BLCKSZ;

/// On-disk identity of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelFileId {
    pub db: Oid,
    pub rel: Oid,
}

impl RelFileId {
    pub const fn new(db: Oid, rel: Oid) -> RelFileId {
        RelFileId { db, rel }
    }
}

/// I/O counters, mostly for tests and monitoring.
#[derive(Debug, Default)]
pub struct DiskStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub flushes: AtomicU64,
    pub syncs: AtomicU64,
    pub extends: AtomicU64,
}

pub struct DiskManager {
    root: PathBuf,
    files: DashMap<RelFileId, Arc<Mutex<File>>>,
    stats: DiskStats,
}

impl DiskManager {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<DiskManager> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DiskManager {
            root,
            files: DashMap::new(),
            stats: DiskStats::default(),
        })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    pub fn db_dir(&self, db: Oid) -> PathBuf {
        self.root.join(db.to_string())
    }

    pub fn path_for(&self, id: RelFileId) -> PathBuf {
        self.db_dir(id.db).join(format!("{}.rel", id.rel))
    }

    /// Create the relation file. Creating an existing relation truncates
    /// it to empty.
    pub fn create(&self, id: RelFileId) -> Result<()> {
        fs::create_dir_all(self.db_dir(id.db))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path_for(id))?;
        self.files.insert(id, Arc::new(Mutex::new(file)));
        debug!(db = id.db, rel = id.rel, "created relation file");
        Ok(())
    }

    fn handle(&self, id: RelFileId) -> Result<Arc<Mutex<File>>> {
        if let Some(h) = self.files.get(&id) {
            return Ok(h.clone());
        }
        fs::create_dir_all(self.db_dir(id.db))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path_for(id))?;
        let h = Arc::new(Mutex::new(file));
        self.files.insert(id, h.clone());
        Ok(h)
    }

    /// Read one block into `buf`. Reading past the end of the file is an
    /// error; callers extend explicitly.
    pub fn read(&self, id: RelFileId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BLCKSZ);
        let h = self.handle(id)?;
        let mut f = h.lock();
        f.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        f.read_exact(buf)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn write(&self, id: RelFileId, block: BlockNumber, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BLCKSZ);
        let h = self.handle(id)?;
        let mut f = h.lock();
        f.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        f.write_all(buf)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write one block and force it to stable storage.
    pub fn flush(&self, id: RelFileId, block: BlockNumber, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BLCKSZ);
        let h = self.handle(id)?;
        let mut f = h.lock();
        f.seek(SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
        f.write_all(buf)?;
        f.sync_all()?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append `count` copies of `buf` and return the new block count.
    pub fn extend(&self, id: RelFileId, buf: &[u8], count: u32) -> Result<BlockNumber> {
        debug_assert_eq!(buf.len(), BLCKSZ);
        let h = self.handle(id)?;
        let mut f = h.lock();
        let len = f.metadata()?.len();
        f.seek(SeekFrom::Start(len))?;
        for _ in 0..count {
            f.write_all(buf)?;
        }
        self.stats.extends.fetch_add(count as u64, Ordering::Relaxed);
        Ok((len / BLCKSZ as u64) as BlockNumber + count)
    }

    pub fn nblocks(&self, id: RelFileId) -> Result<BlockNumber> {
        let h = self.handle(id)?;
        let f = h.lock();
        Ok((f.metadata()?.len() / BLCKSZ as u64) as BlockNumber)
    }

    pub fn truncate(&self, id: RelFileId, nblocks: BlockNumber) -> Result<BlockNumber> {
        let h = self.handle(id)?;
        let f = h.lock();
        f.set_len(nblocks as u64 * BLCKSZ as u64)?;
        Ok(nblocks)
    }

    pub fn sync(&self, id: RelFileId) -> Result<()> {
        let h = self.handle(id)?;
        let f = h.lock();
        f.sync_all()?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop the cached handle. The file is reopened on next use.
    pub fn close(&self, id: RelFileId) {
        self.files.remove(&id);
    }

    pub fn unlink(&self, id: RelFileId) -> Result<()> {
        self.files.remove(&id);
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(db = id.db, rel = id.rel, "unlink of missing relation file");
                Ok(())
            }
            Err(e) => Err(DbError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mgr() -> (TempDir, DiskManager) {
        let dir = TempDir::new().unwrap();
        let mgr = DiskManager::new(dir.path()).unwrap();
        (dir, mgr)
    }

    #[test]
    fn extend_then_read_back() {
        let (_d, mgr) = mgr();
        let id = RelFileId::new(1, 42);
        mgr.create(id).unwrap();
        let block = vec![0xABu8; BLCKSZ];
        assert_eq!(mgr.extend(id, &block, 1).unwrap(), 1);
        assert_eq!(mgr.nblocks(id).unwrap(), 1);

        let mut out = vec![0u8; BLCKSZ];
        mgr.read(id, 0, &mut out).unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn read_past_end_fails() {
        let (_d, mgr) = mgr();
        let id = RelFileId::new(1, 7);
        mgr.create(id).unwrap();
        let mut out = vec![0u8; BLCKSZ];
        assert!(mgr.read(id, 3, &mut out).is_err());
    }

    #[test]
    fn write_at_block_offset() {
        let (_d, mgr) = mgr();
        let id = RelFileId::new(1, 9);
        mgr.create(id).unwrap();
        let zero = vec![0u8; BLCKSZ];
        mgr.extend(id, &zero, 3).unwrap();

        let marked = vec![0x5Au8; BLCKSZ];
        mgr.write(id, 1, &marked).unwrap();

        let mut out = vec![0u8; BLCKSZ];
        mgr.read(id, 1, &mut out).unwrap();
        assert_eq!(out, marked);
        mgr.read(id, 0, &mut out).unwrap();
        assert_eq!(out, zero);
    }

    #[test]
    fn truncate_shrinks() {
        let (_d, mgr) = mgr();
        let id = RelFileId::new(2, 11);
        mgr.create(id).unwrap();
        let zero = vec![0u8; BLCKSZ];
        mgr.extend(id, &zero, 4).unwrap();
        mgr.truncate(id, 1).unwrap();
        assert_eq!(mgr.nblocks(id).unwrap(), 1);
    }

    #[test]
    fn close_and_reopen_preserves_data() {
        let (_d, mgr) = mgr();
        let id = RelFileId::new(1, 100);
        mgr.create(id).unwrap();
        let block = vec![9u8; BLCKSZ];
        mgr.extend(id, &block, 1).unwrap();
        mgr.close(id);
        let mut out = vec![0u8; BLCKSZ];
        mgr.read(id, 0, &mut out).unwrap();
        assert_eq!(out, block);
    }
}
