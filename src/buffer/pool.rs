// Shared buffer pool.
//
// All block-level I/O goes through here. The pool owns the frame array,
// the sharded tag table and the replacement free list, and implements
// pinning, the four context-lock modes, the per-frame I/O phase machine
// and the live/shadow double buffering that lets DBWriter stream a
// stable image while writers keep mutating the live page.
//
// Lock ordering is always buffer-shard -> frame-cntx -> frame-io.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{debug, error, warn};

use crate::buffer::frame::{BufferDesc, IoPhase};
use crate::buffer::freelist::FreeList;
use crate::buffer::table::BufferTable;
use crate::buffer::{BufferEnv, BL_R_LOCK, BL_W_LOCK};
use crate::common::{BlockNumber, BufferTag, FrameId, Oid, RelKind, P_NEW};
use crate::config::CorruptionPolicy;
use crate::error::{DbError, Result};
use crate::poolsweep::SweepRequest;
use crate::relation::Relation;
use crate::storage::checksum::{page_confirm_checksum, page_insert_checksum};
use crate::storage::page::{page_init, page_is_new, BLCKSZ};

/// Context-lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple readers, blocks writers.
    Share,
    /// Single writer, blocks readers and writers.
    Exclusive,
    /// Exclusive that additionally waits until no other pin is
    /// dereferencing the page. Used by bulk-delete and truncation.
    RefExclusive,
    /// Same acquisition as Exclusive; label-only distinction.
    ReadExclusive,
}

/// Write intents for the I/O phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Synchronous flush of a special-relation page.
    Flush,
    /// DBWriter home-file write; consumes both DIRTY and LOGGED.
    Commit,
    /// Write that leaves the page re-loggable.
    Normal,
}

pub struct BufferPool {
    frames: Vec<BufferDesc>,
    table: BufferTable,
    free: FreeList,
    generation: AtomicU64,
    heap_corruption: CorruptionPolicy,
    index_corruption: CorruptionPolicy,
    sweep: OnceLock<crossbeam::channel::Sender<SweepRequest>>,
}

impl BufferPool {
    pub fn new(
        nframes: usize,
        heap_corruption: CorruptionPolicy,
        index_corruption: CorruptionPolicy,
    ) -> BufferPool {
        let nshards = num_cpus::get().next_power_of_two().min(64);
        BufferPool {
            frames: (0..nframes).map(BufferDesc::new).collect(),
            table: BufferTable::new(nshards),
            free: FreeList::new(nframes),
            generation: AtomicU64::new(1),
            heap_corruption,
            index_corruption,
            sweep: OnceLock::new(),
        }
    }

    pub fn set_sweep(&self, tx: crossbeam::channel::Sender<SweepRequest>) {
        let _ = self.sweep.set(tx);
    }

    #[inline]
    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn frame(&self, id: FrameId) -> &BufferDesc {
        &self.frames[id]
    }

    pub fn tag_of(&self, id: FrameId) -> BufferTag {
        self.frames[id].cntx.lock().tag
    }

    pub fn block_of(&self, id: FrameId) -> BlockNumber {
        self.frames[id].cntx.lock().tag.block
    }

    pub fn kind_of(&self, id: FrameId) -> RelKind {
        self.frames[id].cntx.lock().kind
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    /// Shared-side pin. `pageaccess` marks pins that will dereference
    /// the page bytes; those wait out an in-flight REF_EXCLUSIVE.
    pub fn manual_pin(&self, id: FrameId, pageaccess: bool) -> bool {
        let frame = &self.frames[id];
        let mut cntx = frame.cntx.lock();
        if pageaccess {
            while cntx.exclusive {
                cntx.p_waiting += 1;
                frame.cntx_gate.wait(&mut cntx);
                cntx.p_waiting -= 1;
            }
        }
        if !cntx.resident() {
            return false;
        }
        cntx.ref_count += 1;
        if pageaccess {
            cntx.page_access += 1;
        }
        true
    }

    pub fn manual_unpin(&self, id: FrameId, pageaccess: bool) {
        let frame = &self.frames[id];
        let free_now;
        {
            let mut cntx = frame.cntx.lock();
            debug_assert!(cntx.ref_count > 0, "unpin of unpinned frame {}", id);
            cntx.ref_count = cntx.ref_count.saturating_sub(1);
            if pageaccess {
                cntx.page_access = cntx.page_access.saturating_sub(1);
                if cntx.e_waiting > 0 {
                    frame.cntx_gate.notify_all();
                }
            }
            free_now = cntx.ref_count == 0;
        }
        if free_now {
            self.free.put(&self.frames, id);
        }
    }

    /// Private-side pin: the first private reference takes one shared
    /// pin; later ones only bump the task-local count.
    pub fn pin(&self, env: &mut BufferEnv, id: FrameId) -> bool {
        if env.private_ref[id] == 0 && !self.manual_pin(id, true) {
            return false;
        }
        env.private_ref[id] += 1;
        env.total_pins += 1;
        true
    }

    pub fn unpin(&self, env: &mut BufferEnv, id: FrameId) {
        if env.private_ref[id] == 0 {
            warn!(frame = id, "too many unpins");
            return;
        }
        env.private_ref[id] -= 1;
        env.total_pins -= 1;
        if env.private_ref[id] == 0 {
            self.manual_unpin(id, true);
        }
    }

    /// Increment a pin we already hold.
    pub fn incr_ref_count(&self, env: &mut BufferEnv, id: FrameId) {
        debug_assert!(env.private_ref[id] > 0);
        env.private_ref[id] += 1;
        env.total_pins += 1;
    }

    /// Bias a pinned frame against replacement.
    pub fn bias_buffer(&self, env: &BufferEnv, id: FrameId) -> bool {
        if env.private_ref[id] == 0 {
            return false;
        }
        self.frames[id].cntx.lock().bias += 1;
        true
    }

    /// True when the calling task holds the only page access.
    pub fn buffer_is_private(&self, env: &BufferEnv, id: FrameId) -> bool {
        let cntx = self.frames[id].cntx.lock();
        cntx.page_access == 1 && env.private_ref[id] == 1
    }

    // ========================================================================
    // Context locks
    // ========================================================================

    pub fn lock_buffer(&self, env: &mut BufferEnv, id: FrameId, mode: LockMode) {
        let frame = &self.frames[id];
        let mut cntx = frame.cntx.lock();
        let bits = env.lock_bits[id];
        match mode {
            LockMode::Share => {
                debug_assert!(bits & (BL_R_LOCK | BL_W_LOCK) == 0);
                while cntx.write_lock || cntx.w_waiting > 0 {
                    cntx.r_waiting += 1;
                    frame.cntx_gate.wait(&mut cntx);
                    cntx.r_waiting -= 1;
                    if !cntx.write_lock {
                        break;
                    }
                }
                cntx.r_locks += 1;
                env.lock_bits[id] = bits | BL_R_LOCK;
            }
            LockMode::Exclusive | LockMode::ReadExclusive => {
                debug_assert!(bits & (BL_R_LOCK | BL_W_LOCK) == 0);
                while cntx.r_locks > 0 || cntx.write_lock {
                    cntx.w_waiting += 1;
                    frame.cntx_gate.wait(&mut cntx);
                    cntx.w_waiting -= 1;
                }
                cntx.write_lock = true;
                cntx.w_owner = env.id;
                env.lock_bits[id] = bits | BL_W_LOCK;
            }
            LockMode::RefExclusive => {
                debug_assert!(bits & (BL_R_LOCK | BL_W_LOCK) == 0);
                while cntx.page_access > cntx.e_waiting + 1 {
                    cntx.e_waiting += 1;
                    frame.cntx_gate.wait(&mut cntx);
                    cntx.e_waiting -= 1;
                }
                cntx.write_lock = true;
                cntx.exclusive = true;
                cntx.critical = true;
                cntx.w_owner = env.id;
                env.lock_bits[id] = bits | BL_W_LOCK;
            }
        }
    }

    pub fn unlock_buffer(&self, env: &mut BufferEnv, id: FrameId) {
        let frame = &self.frames[id];
        let mut cntx = frame.cntx.lock();
        let mut signal = false;
        let bits = env.lock_bits[id];
        if bits & BL_R_LOCK != 0 {
            debug_assert!(cntx.r_locks > 0);
            cntx.r_locks -= 1;
            if cntx.r_locks == 0 {
                signal = true;
            }
        } else if bits & BL_W_LOCK != 0 {
            debug_assert!(cntx.write_lock);
            cntx.write_lock = false;
            cntx.exclusive = false;
            cntx.critical = false;
            cntx.w_owner = 0;
            signal = true;
        }
        env.lock_bits[id] = 0;
        if signal {
            // writers are preferred only when no readers or pin waiters
            // are blocked
            if cntx.r_waiting + cntx.p_waiting > 0 {
                frame.cntx_gate.notify_all();
            } else if cntx.w_waiting + cntx.e_waiting > 0 {
                frame.cntx_gate.notify_one();
            }
        }
    }

    /// Release every context lock this task still holds (abort path).
    pub fn unlock_all(&self, env: &mut BufferEnv) {
        for id in 0..self.frames.len() {
            if env.lock_bits[id] != 0 {
                self.unlock_buffer(env, id);
            }
        }
    }

    // ========================================================================
    // I/O phase machine
    // ========================================================================

    /// Wait for any conflicting I/O to finish. With `write_mode` every
    /// phase conflicts; otherwise only INBOUND and READ do. Returns
    /// false if the frame is poisoned.
    pub fn wait_buffer_io(&self, write_mode: bool, id: FrameId) -> bool {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        loop {
            let conflict = if write_mode {
                io.in_progress()
            } else {
                matches!(io.phase, IoPhase::Inbound | IoPhase::Read)
            };
            if !conflict {
                break;
            }
            frame.io_gate.wait(&mut io);
        }
        io.phase != IoPhase::Error
    }

    pub fn inbound_begin(&self, id: FrameId) {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        debug_assert!(!io.in_progress());
        io.dirty = false;
        io.logged = false;
        io.phase = IoPhase::Inbound;
    }

    pub fn cancel_inbound(&self, id: FrameId) {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        debug_assert_eq!(io.phase, IoPhase::Inbound);
        io.phase = IoPhase::Error;
        frame.io_gate.notify_all();
    }

    pub fn read_begin(&self, id: FrameId) -> bool {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        if io.phase == IoPhase::Error {
            return false;
        }
        debug_assert_eq!(io.phase, IoPhase::Inbound);
        io.phase = IoPhase::Read;
        true
    }

    /// Claim the frame for shadow logging. True only when the frame was
    /// still dirty; a false return means the write was coalesced away.
    pub fn log_begin(&self, id: FrameId) -> bool {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        while io.in_progress() {
            frame.io_gate.wait(&mut io);
        }
        if io.phase == IoPhase::Error {
            return false;
        }
        if io.dirty {
            io.phase = IoPhase::Log;
            io.dirty = false;
            true
        } else {
            false
        }
    }

    pub fn write_begin(&self, id: FrameId, mode: WriteMode) -> bool {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        while io.in_progress() {
            frame.io_gate.wait(&mut io);
        }
        if io.phase == IoPhase::Error {
            return false;
        }
        let warranted = match mode {
            WriteMode::Flush => {
                io.dirty = false;
                io.logged = false;
                true
            }
            WriteMode::Commit => {
                let w = io.dirty || io.logged;
                io.dirty = false;
                io.logged = false;
                w
            }
            WriteMode::Normal => {
                let w = io.dirty || io.logged;
                io.logged = false;
                w
            }
        };
        if warranted {
            io.phase = IoPhase::Write;
        }
        warranted
    }

    /// Finish the active phase: LOG leaves the LOGGED bit behind, every
    /// terminate wakes the gate.
    pub fn terminate_io(&self, id: FrameId) {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        if io.in_progress() {
            if io.phase == IoPhase::Log {
                io.logged = true;
            }
            io.phase = IoPhase::Idle;
            frame.io_gate.notify_all();
        }
    }

    /// Terminal failure. The frame stays poisoned until recycled.
    pub fn error_io(&self, id: FrameId) {
        let frame = &self.frames[id];
        {
            let mut io = frame.io.lock();
            io.phase = IoPhase::Error;
            io.dirty = false;
            io.logged = false;
            frame.io_gate.notify_all();
        }
        let cntx = frame.cntx.lock();
        error!(
            frame = id,
            rel = %cntx.blind.rel_name,
            block = cntx.tag.block,
            "buffer IO error"
        );
    }

    /// Mark the live page dirty. Only DBWriter ever clears this.
    pub fn dirty(&self, id: FrameId) {
        self.frames[id].io.lock().dirty = true;
    }

    pub fn is_dirty(&self, id: FrameId) -> bool {
        let io = self.frames[id].io.lock();
        io.phase != IoPhase::Error && io.dirty
    }

    pub fn has_error(&self, id: FrameId) -> bool {
        self.frames[id].io.lock().phase == IoPhase::Error
    }

    fn clear_io(&self, id: FrameId) {
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        if io.phase == IoPhase::Error {
            return;
        }
        while io.in_progress() {
            frame.io_gate.wait(&mut io);
        }
        io.phase = IoPhase::Error;
        io.dirty = false;
        io.logged = false;
        frame.io_gate.notify_all();
    }

    // ========================================================================
    // Shadow pages and generations
    // ========================================================================

    /// Advance the pool generation. Called by DBWriter at the start of
    /// each pass; makes every frame's shadow stale.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn shadow_if_needed(&self, id: FrameId, forflush: bool) -> bool {
        let gen = self.generation.load(Ordering::Acquire);
        let frame = &self.frames[id];
        let mut io = frame.io.lock();
        if io.generation < gen || (forflush && io.generation == gen) {
            // safety: io mutex held
            unsafe { frame.copy_to_shadow() };
            io.generation = gen;
            true
        } else {
            false
        }
    }

    /// Live page bytes for reading. Caller holds a pin and a context
    /// lock. A pending generation bump first refreshes the shadow.
    pub fn page(&self, id: FrameId) -> &[u8] {
        self.shadow_if_needed(id, false);
        unsafe { self.frames[id].page() }
    }

    /// Live page bytes for mutation. Caller holds a pin and an
    /// EXCLUSIVE-class context lock.
    #[allow(clippy::mut_from_ref)]
    pub fn page_mut(&self, id: FrameId) -> &mut [u8] {
        self.shadow_if_needed(id, false);
        unsafe { self.frames[id].page_mut() }
    }

    /// Produce the stable image for writeout: refresh the shadow,
    /// recompute the checksum for non-special relkinds, return the
    /// shadow. This is what SMGR reads from during writeout.
    pub fn advance_buffer_io(&self, id: FrameId, forflush: bool) -> &[u8] {
        self.shadow_if_needed(id, forflush);
        let kind = self.kind_of(id);
        let frame = &self.frames[id];
        {
            let _io = frame.io.lock();
            if kind != RelKind::Special {
                // safety: io mutex held
                unsafe {
                    page_insert_checksum(frame.shadow_page_mut());
                }
            }
        }
        unsafe { frame.shadow_page() }
    }

    // ========================================================================
    // Lookup and replacement
    // ========================================================================

    /// Verify a pinned frame still carries the expected identity.
    pub fn check_buffer_tag(
        &self,
        id: FrameId,
        block: BlockNumber,
        rel: Oid,
        db: Oid,
    ) -> bool {
        let cntx = self.frames[id].cntx.lock();
        debug_assert!(cntx.ref_count > 0);
        if !cntx.valid {
            return false;
        }
        if rel != 0 && cntx.tag.rel != rel {
            return false;
        }
        if db != 0 && cntx.tag.db != db {
            return false;
        }
        if block != crate::common::INVALID_BLOCK && cntx.tag.block != block {
            return false;
        }
        true
    }

    /// Returns a pinned frame containing the requested block, reading
    /// it from disk on a cache miss. `P_NEW` extends the relation.
    pub fn read_buffer(
        &self,
        env: &mut BufferEnv,
        rel: &Relation,
        mut block: BlockNumber,
    ) -> Result<FrameId> {
        if block == P_NEW {
            let mut init = vec![0u8; BLCKSZ];
            if rel.kind != RelKind::Special {
                page_init(&mut init, 0);
                page_insert_checksum(&mut init);
            }
            let nblocks = rel.smgr_extend(&init, 1)?;
            block = nblocks - 1;
        }

        let tag = BufferTag::new(rel.db, rel.id, block);
        loop {
            if let Some(id) = self.table.lookup(&tag) {
                if !self.pin(env, id) {
                    debug!(frame = id, "pin raced with invalidation");
                    continue;
                }
                if self.check_buffer_tag(id, block, rel.id, rel.db) {
                    if self.wait_buffer_io(false, id) {
                        return Ok(id);
                    }
                }
                self.unpin(env, id);
                continue;
            }

            let id = match self.free.take(&self.frames, &self.table) {
                Some(id) => id,
                None => {
                    return Err(DbError::Exhausted(
                        "no unpinned clean buffer available".into(),
                    ))
                }
            };
            self.inbound_begin(id);

            if !self.table.insert(tag, id) {
                // a concurrent insert won; drop our frame and retry
                self.cancel_inbound(id);
                self.free.put_back(&self.frames, id);
                continue;
            }

            {
                let mut cntx = self.frames[id].cntx.lock();
                cntx.tag = tag;
                cntx.kind = rel.kind;
                cntx.blind.db_name = rel.db_name.clone();
                cntx.blind.rel_name = rel.name.clone();
                cntx.used = true;
                cntx.valid = true;
                cntx.deleted = false;
            }
            env.private_ref[id] = 1;
            env.total_pins += 1;

            return self.complete_read(env, rel, id, block);
        }
    }

    fn complete_read(
        &self,
        env: &mut BufferEnv,
        rel: &Relation,
        id: FrameId,
        block: BlockNumber,
    ) -> Result<FrameId> {
        if !self.read_begin(id) {
            self.error_io(id);
            self.invalidate(id);
            self.unpin(env, id);
            return Err(DbError::Io(std::io::Error::other(
                "read buffer failed in io start",
            )));
        }

        // safety: this task holds the frame's READ phase
        let page = unsafe { self.frames[id].page_mut() };
        if let Err(e) = rel.smgr_read(block, page) {
            self.error_io(id);
            self.invalidate(id);
            self.unpin(env, id);
            return Err(e);
        }
        self.frames[id].io.lock().generation = 0;

        let mut status = Ok(());
        match rel.kind {
            RelKind::Index => {
                if !page_is_new(page) && !page_confirm_checksum(page) {
                    warn!(
                        rel = %rel.name,
                        block, "index page failed checksum verification"
                    );
                    if self.index_corruption == CorruptionPolicy::Ignore {
                        if let Some(tx) = self.sweep.get() {
                            let _ = tx.send(SweepRequest::Reindex {
                                db: rel.db,
                                rel: rel.id,
                                db_name: rel.db_name.clone(),
                                rel_name: rel.name.clone(),
                            });
                        }
                    }
                    status = Err(DbError::Corrupted(format!(
                        "index page {}:{} of {}",
                        rel.id, block, rel.name
                    )));
                }
            }
            RelKind::Heap => {
                if !page_is_new(page) && !page_confirm_checksum(page) {
                    warn!(
                        rel = %rel.name,
                        block, "heap page failed checksum verification"
                    );
                    if self.heap_corruption == CorruptionPolicy::Ignore {
                        page_init(page, 0);
                        page_insert_checksum(page);
                        self.dirty(id);
                    } else {
                        status = Err(DbError::Corrupted(format!(
                            "heap page {}:{} of {}",
                            rel.id, block, rel.name
                        )));
                    }
                }
            }
            _ => {}
        }

        match status {
            Ok(()) => {
                self.terminate_io(id);
                Ok(id)
            }
            Err(e) => {
                self.error_io(id);
                self.invalidate(id);
                self.unpin(env, id);
                Err(e)
            }
        }
    }

    /// Combined release + read: keeps the frame when the tag still
    /// matches.
    pub fn release_and_read_buffer(
        &self,
        env: &mut BufferEnv,
        rel: &Relation,
        cur: Option<FrameId>,
        block: BlockNumber,
    ) -> Result<FrameId> {
        if let Some(id) = cur {
            if block != P_NEW
                && self.check_buffer_tag(id, block, rel.id, rel.db)
                && self.wait_buffer_io(false, id)
            {
                return Ok(id);
            }
            self.unpin(env, id);
        }
        self.read_buffer(env, rel, block)
    }

    pub fn release_buffer(&self, env: &mut BufferEnv, id: FrameId) {
        self.unpin(env, id);
    }

    fn invalidate(&self, id: FrameId) {
        self.clear_io(id);
        let mut cntx = self.frames[id].cntx.lock();
        if cntx.resident() {
            let tag = cntx.tag;
            drop(cntx);
            self.table.delete(&tag, id);
            cntx = self.frames[id].cntx.lock();
        }
        cntx.valid = false;
        cntx.deleted = true;
    }

    /// Drop every cached page of one relation. Dirty pages are simply
    /// discarded; the caller holds an exclusive relation lock.
    pub fn invalidate_relation_buffers(&self, rel: &Relation) {
        for id in 0..self.frames.len() {
            if self.manual_pin(id, true) {
                if self.check_buffer_tag(id, crate::common::INVALID_BLOCK, rel.id, rel.db) {
                    self.invalidate(id);
                }
                self.manual_unpin(id, true);
            }
        }
        rel.invalidate_nblocks();
    }

    /// Drop every cached page of one database.
    pub fn drop_database_buffers(&self, db: Oid) {
        for id in 0..self.frames.len() {
            if self.manual_pin(id, true) {
                if self.check_buffer_tag(id, crate::common::INVALID_BLOCK, 0, db) {
                    self.invalidate(id);
                }
                self.manual_unpin(id, true);
            }
        }
    }

    // ========================================================================
    // End-of-transaction accounting
    // ========================================================================

    /// Log any private pins still held; returns the leak count.
    pub fn check_leak(&self, env: &BufferEnv) -> usize {
        let mut leaks = 0;
        for id in 0..self.frames.len() {
            if env.private_ref[id] != 0 {
                let cntx = self.frames[id].cntx.lock();
                warn!(
                    frame = id,
                    rel = %cntx.blind.rel_name,
                    block = cntx.tag.block,
                    private = env.private_ref[id],
                    shared = cntx.ref_count,
                    "buffer leak"
                );
                leaks += 1;
            }
        }
        leaks
    }

    /// Release all pins held by the task. Called at abort, and at
    /// commit when the leak check found residue.
    pub fn reset(&self, env: &mut BufferEnv) {
        for id in 0..self.frames.len() {
            if env.private_ref[id] != 0 {
                self.manual_unpin(id, true);
            }
            env.private_ref[id] = 0;
        }
        env.total_pins = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{AttrDesc, TupleDesc};
    use crate::storage::disk::DiskManager;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(nframes: usize) -> (TempDir, Arc<Relation>, BufferPool, BufferEnv) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let desc = Arc::new(TupleDesc::new(vec![AttrDesc::int4("v")]));
        let rel = Arc::new(Relation::new(
            disk, 1, 300, "system", "t", RelKind::Heap, desc,
        ));
        rel.smgr_create().unwrap();
        let pool = BufferPool::new(nframes, CorruptionPolicy::Raise, CorruptionPolicy::Raise);
        let env = BufferEnv::new(nframes, 1);
        (dir, rel, pool, env)
    }

    #[test]
    fn extend_and_reread_same_frame() {
        let (_d, rel, pool, mut env) = setup(8);
        let a = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        let block = pool.block_of(a);
        assert_eq!(block, 0);
        pool.release_buffer(&mut env, a);

        let b = pool.read_buffer(&mut env, &rel, 0).unwrap();
        assert_eq!(a, b);
        pool.release_buffer(&mut env, b);
        assert_eq!(pool.check_leak(&env), 0);
    }

    #[test]
    fn private_pins_share_one_shared_pin() {
        let (_d, rel, pool, mut env) = setup(8);
        let f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        assert!(pool.pin(&mut env, f));
        assert_eq!(env.private_ref[f], 2);
        assert_eq!(pool.frame(f).cntx.lock().ref_count, 1);
        pool.unpin(&mut env, f);
        pool.unpin(&mut env, f);
        assert_eq!(pool.frame(f).cntx.lock().ref_count, 0);
    }

    #[test]
    fn dirty_frame_is_never_replaced() {
        let (_d, rel, pool, mut env) = setup(1);
        let f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        pool.dirty(f);
        pool.release_buffer(&mut env, f);

        // the only frame is dirty, so a second block cannot come in
        let err = pool.read_buffer(&mut env, &rel, P_NEW).unwrap_err();
        assert!(matches!(err, DbError::Exhausted(_)));
    }

    #[test]
    fn write_commit_consumes_dirty_and_logged() {
        let (_d, rel, pool, mut env) = setup(4);
        let f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        pool.dirty(f);
        assert!(pool.log_begin(f));
        pool.terminate_io(f);
        assert!(pool.frame(f).io.lock().logged);

        assert!(pool.write_begin(f, WriteMode::Commit));
        pool.terminate_io(f);
        let io = pool.frame(f).io.lock();
        assert!(!io.dirty && !io.logged);
        drop(io);
        // a second write pass finds nothing to do
        assert!(!pool.write_begin(f, WriteMode::Commit));
        pool.release_buffer(&mut env, f);
    }

    #[test]
    fn log_begin_on_clean_frame_reports_coalesced() {
        let (_d, rel, pool, mut env) = setup(4);
        let f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        assert!(!pool.log_begin(f));
        pool.release_buffer(&mut env, f);
    }

    #[test]
    fn invalidate_relation_buffers_drops_residency() {
        let (_d, rel, pool, mut env) = setup(4);
        let f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        pool.release_buffer(&mut env, f);
        pool.invalidate_relation_buffers(&rel);

        // a fresh read must produce a newly loaded frame
        let g = pool.read_buffer(&mut env, &rel, 0).unwrap();
        assert!(pool.check_buffer_tag(g, 0, rel.id, rel.db));
        pool.release_buffer(&mut env, g);
    }

    #[test]
    fn shadow_advances_with_generation() {
        let (_d, rel, pool, mut env) = setup(4);
        let f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        pool.page_mut(f)[100] = 0x42;
        pool.bump_generation();
        let stable = pool.advance_buffer_io(f, false);
        assert_eq!(stable[100], 0x42);
        pool.release_buffer(&mut env, f);
    }

    #[test]
    fn leak_check_reports_held_pins() {
        let (_d, rel, pool, mut env) = setup(4);
        let _f = pool.read_buffer(&mut env, &rel, P_NEW).unwrap();
        assert_eq!(pool.check_leak(&env), 1);
        pool.reset(&mut env);
        assert_eq!(pool.check_leak(&env), 0);
    }
}
