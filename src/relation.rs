// Relation handles and the shared relation cache.
//
// A `Relation` bundles the identity, kind and tuple descriptor of a
// relation with its storage-manager file. Handles are shared through a
// concurrent cache keyed by (db, relid).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::common::{BlockNumber, Oid, RelKind, TupleDesc, INVALID_BLOCK};
use crate::error::Result;
use crate::storage::disk::{DiskManager, RelFileId};

/// Index-specific description: which heap it indexes and by which
/// attributes.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub heap: Oid,
    /// 1-based heap attribute numbers forming the key.
    pub keyattrs: Vec<u16>,
    pub unique: bool,
}

pub struct Relation {
    pub id: Oid,
    pub db: Oid,
    pub name: String,
    pub db_name: String,
    pub kind: RelKind,
    pub desc: Arc<TupleDesc>,
    pub index: Option<IndexInfo>,
    /// Transaction-private relation: pages live in the task-local
    /// buffer pool, never in the shared cache.
    pub xact_only: bool,
    disk: Arc<DiskManager>,
    nblocks: AtomicU32,
}

impl Relation {
    pub fn new(
        disk: Arc<DiskManager>,
        db: Oid,
        id: Oid,
        db_name: &str,
        name: &str,
        kind: RelKind,
        desc: Arc<TupleDesc>,
    ) -> Relation {
        Relation {
            id,
            db,
            name: name.to_string(),
            db_name: db_name.to_string(),
            kind,
            desc,
            index: None,
            xact_only: false,
            disk,
            nblocks: AtomicU32::new(INVALID_BLOCK),
        }
    }

    pub fn with_index(mut self, info: IndexInfo) -> Relation {
        self.index = Some(info);
        self
    }

    pub fn as_temp(mut self) -> Relation {
        self.xact_only = true;
        self
    }

    #[inline]
    pub fn file(&self) -> RelFileId {
        RelFileId::new(self.db, self.id)
    }

    #[inline]
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn smgr_create(&self) -> Result<()> {
        self.nblocks.store(0, Ordering::Release);
        self.disk.create(self.file())
    }

    pub fn smgr_read(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        self.disk.read(self.file(), block, buf)
    }

    pub fn smgr_write(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
        self.disk.write(self.file(), block, buf)
    }

    pub fn smgr_flush(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
        self.disk.flush(self.file(), block, buf)
    }

    pub fn smgr_extend(&self, buf: &[u8], count: u32) -> Result<BlockNumber> {
        let n = self.disk.extend(self.file(), buf, count)?;
        self.nblocks.store(n, Ordering::Release);
        Ok(n)
    }

    pub fn smgr_sync(&self) -> Result<()> {
        self.disk.sync(self.file())
    }

    pub fn smgr_truncate(&self, nblocks: BlockNumber) -> Result<BlockNumber> {
        let n = self.disk.truncate(self.file(), nblocks)?;
        self.nblocks.store(n, Ordering::Release);
        Ok(n)
    }

    pub fn smgr_unlink(&self) -> Result<()> {
        self.nblocks.store(0, Ordering::Release);
        self.disk.unlink(self.file())
    }

    /// Cached block count, refreshed from the file on first use.
    pub fn nblocks(&self) -> Result<BlockNumber> {
        let cached = self.nblocks.load(Ordering::Acquire);
        if cached != INVALID_BLOCK {
            return Ok(cached);
        }
        let n = self.disk.nblocks(self.file())?;
        self.nblocks.store(n, Ordering::Release);
        Ok(n)
    }

    /// Force a re-read of the block count on next access.
    pub fn invalidate_nblocks(&self) {
        self.nblocks.store(INVALID_BLOCK, Ordering::Release);
    }

    pub fn set_nblocks(&self, n: BlockNumber) {
        self.nblocks.store(n, Ordering::Release);
    }
}

/// Shared cache of open relation handles.
pub struct RelationCache {
    by_id: DashMap<(Oid, Oid), Arc<Relation>>,
    by_name: DashMap<(Oid, String), Oid>,
}

impl RelationCache {
    pub fn new() -> RelationCache {
        RelationCache {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
        }
    }

    pub fn insert(&self, rel: Arc<Relation>) {
        self.by_name
            .insert((rel.db, rel.name.clone()), rel.id);
        self.by_id.insert((rel.db, rel.id), rel);
    }

    pub fn get(&self, db: Oid, id: Oid) -> Option<Arc<Relation>> {
        self.by_id.get(&(db, id)).map(|r| r.clone())
    }

    pub fn get_by_name(&self, db: Oid, name: &str) -> Option<Arc<Relation>> {
        let id = *self.by_name.get(&(db, name.to_string()))?;
        self.get(db, id)
    }

    pub fn remove(&self, db: Oid, id: Oid) {
        if let Some((_, rel)) = self.by_id.remove(&(db, id)) {
            self.by_name.remove(&(db, rel.name.clone()));
        }
    }

    pub fn all(&self) -> Vec<Arc<Relation>> {
        self.by_id.iter().map(|r| r.clone()).collect()
    }
}

impl Default for RelationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AttrDesc;
    use tempfile::TempDir;

    #[test]
    fn cache_lookup_by_name_and_id() {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let desc = Arc::new(TupleDesc::new(vec![AttrDesc::int4("x")]));
        let rel = Arc::new(Relation::new(
            disk, 1, 200, "system", "widgets", RelKind::Heap, desc,
        ));
        let cache = RelationCache::new();
        cache.insert(rel);

        assert!(cache.get(1, 200).is_some());
        assert_eq!(cache.get_by_name(1, "widgets").unwrap().id, 200);
        cache.remove(1, 200);
        assert!(cache.get_by_name(1, "widgets").is_none());
    }

    #[test]
    fn nblocks_tracks_extension() {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let desc = Arc::new(TupleDesc::new(vec![AttrDesc::int4("x")]));
        let rel = Relation::new(disk, 1, 201, "system", "t", RelKind::Heap, desc);
        rel.smgr_create().unwrap();
        assert_eq!(rel.nblocks().unwrap(), 0);
        let zero = vec![0u8; crate::storage::page::BLCKSZ];
        rel.smgr_extend(&zero, 2).unwrap();
        assert_eq!(rel.nblocks().unwrap(), 2);
    }
}
