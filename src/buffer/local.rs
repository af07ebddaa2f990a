// Task-local buffer pool.
//
// Transaction-private relations never enter the shared cache; their
// pages are held here, written back by `sync` at commit and discarded
// wholesale at abort. No locking: the pool lives inside one task's
// environment.

use std::cell::UnsafeCell;
use std::collections::HashMap;

use crate::buffer::frame::PageBuffer;
use crate::common::{BlockNumber, BufferTag, RelKind, P_NEW};
use crate::error::Result;
use crate::relation::Relation;
use crate::storage::checksum::page_insert_checksum;
use crate::storage::disk::{DiskManager, RelFileId};
use crate::storage::page::{page_init, BLCKSZ};

pub struct LocalBuf {
    pub tag: BufferTag,
    pub kind: RelKind,
    pub dirty: bool,
    pub refcount: i64,
    // the owning task hands out raw page pointers to itself
    page: Box<UnsafeCell<PageBuffer>>,
}

pub struct LocalBufferPool {
    slots: Vec<LocalBuf>,
    map: HashMap<BufferTag, usize>,
}

impl LocalBufferPool {
    pub fn new() -> LocalBufferPool {
        LocalBufferPool {
            slots: Vec::new(),
            map: HashMap::new(),
        }
    }

    /// Read a block of a transaction-private relation, extending on
    /// `P_NEW`. Returns the local slot index.
    pub fn read(&mut self, rel: &Relation, mut block: BlockNumber) -> Result<usize> {
        debug_assert!(rel.xact_only);
        if block == P_NEW {
            let mut init = vec![0u8; BLCKSZ];
            page_init(&mut init, 0);
            page_insert_checksum(&mut init);
            let nblocks = rel.smgr_extend(&init, 1)?;
            block = nblocks - 1;
        }
        let tag = BufferTag::new(rel.db, rel.id, block);
        if let Some(&idx) = self.map.get(&tag) {
            self.slots[idx].refcount += 1;
            return Ok(idx);
        }
        let mut page = PageBuffer::new();
        rel.smgr_read(block, page.data_mut())?;
        // repr(transparent) makes this cast sound
        let page = unsafe {
            Box::from_raw(Box::into_raw(page) as *mut UnsafeCell<PageBuffer>)
        };
        let idx = self.slots.len();
        self.slots.push(LocalBuf {
            tag,
            kind: rel.kind,
            dirty: false,
            refcount: 1,
            page,
        });
        self.map.insert(tag, idx);
        Ok(idx)
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &LocalBuf {
        &self.slots[idx]
    }

    /// Raw page pointer; stable for the life of the slot. The pool is
    /// task-private, so the owning task is the only possible accessor.
    #[inline]
    pub fn page_ptr(&self, idx: usize) -> *mut u8 {
        unsafe { (*self.slots[idx].page.get()).data_mut().as_mut_ptr() }
    }

    pub fn mark_dirty(&mut self, idx: usize, release: bool) {
        self.slots[idx].dirty = true;
        if release {
            self.release(idx);
        }
    }

    pub fn release(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if slot.refcount > 0 {
            slot.refcount -= 1;
        }
    }

    /// Write every dirty local page back to its file. Called from the
    /// commit path whether or not shared buffers changed.
    pub fn sync(&mut self, disk: &DiskManager) -> Result<()> {
        for slot in self.slots.iter_mut() {
            if slot.dirty {
                let page = slot.page.get_mut();
                if slot.kind != RelKind::Special {
                    page_insert_checksum(page.data_mut());
                }
                let id = RelFileId::new(slot.tag.db, slot.tag.rel);
                disk.write(id, slot.tag.block, page.data())?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop everything, dirty or not (abort path).
    pub fn reset(&mut self) {
        self.slots.clear();
        self.map.clear();
    }

    /// Drop any cached pages of one relation.
    pub fn forget_relation(&mut self, db: u32, rel: u32) {
        let stale: Vec<BufferTag> = self
            .map
            .keys()
            .filter(|t| t.db == db && t.rel == rel)
            .copied()
            .collect();
        for tag in stale {
            if let Some(idx) = self.map.remove(&tag) {
                self.slots[idx].dirty = false;
                self.slots[idx].refcount = 0;
            }
        }
    }

    pub fn held_pins(&self) -> i64 {
        self.slots.iter().map(|s| s.refcount).sum()
    }
}

impl Default for LocalBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{AttrDesc, TupleDesc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn temp_rel() -> (TempDir, Arc<DiskManager>, Relation) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let desc = Arc::new(TupleDesc::new(vec![AttrDesc::int4("v")]));
        let rel = Relation::new(
            disk.clone(),
            1,
            900,
            "system",
            "scratch",
            RelKind::Heap,
            desc,
        )
        .as_temp();
        rel.smgr_create().unwrap();
        (dir, disk, rel)
    }

    #[test]
    fn extend_cache_and_sync() {
        let (_d, disk, rel) = temp_rel();
        let mut local = LocalBufferPool::new();
        let idx = local.read(&rel, P_NEW).unwrap();
        unsafe {
            *local.page_ptr(idx).add(100) = 0x9A;
        }
        local.mark_dirty(idx, true);
        local.sync(&disk).unwrap();

        let mut out = vec![0u8; BLCKSZ];
        rel.smgr_read(0, &mut out).unwrap();
        assert_eq!(out[100], 0x9A);
    }

    #[test]
    fn reset_discards_dirty_pages() {
        let (_d, disk, rel) = temp_rel();
        let mut local = LocalBufferPool::new();
        let idx = local.read(&rel, P_NEW).unwrap();
        unsafe {
            *local.page_ptr(idx).add(50) = 0x77;
        }
        local.mark_dirty(idx, true);
        local.reset();
        local.sync(&disk).unwrap();

        let mut out = vec![0u8; BLCKSZ];
        rel.smgr_read(0, &mut out).unwrap();
        assert_ne!(out[50], 0x77);
    }

    #[test]
    fn repeated_read_hits_cache() {
        let (_d, _disk, rel) = temp_rel();
        let mut local = LocalBufferPool::new();
        let a = local.read(&rel, P_NEW).unwrap();
        local.release(a);
        let b = local.read(&rel, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(local.slot(b).refcount, 1);
    }
}
