// DBWriter: the dedicated writer task.
//
// Two write groups linked in a cycle collect pending commits and
// dirtied frames; exactly one is current at any time. A committing task
// appends its (xid, status) under the current group's mutex and either
// blocks for the completion broadcast (hard commit) or stamps a
// SOFT_COMMIT on the status page itself and returns (soft commit). The
// writer rotates the current pointer, appends every registered frame to
// the shadow log, flushes the transaction-status pages, then either
// defers the data-page writes into a persistent sync accumulator or
// drains the accumulator and writes everything home, fsyncing per
// relation and truncating the shadow log afterwards.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, WriteMode};
use crate::common::{
    BufferTag, FrameId, Oid, TransactionId, XidStatus, INVALID_XID,
};
use crate::config::{CommitType, DbConfig};
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::relation::Relation;
use crate::storage::disk::{DiskManager, RelFileId};
use crate::storage::shadow::{ShadowLog, ShadowRecord};
use crate::transaction::xlog::{page_set_xid_status, xid_to_block, TransactionLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    NotReady,
    Waiting,
    Ready,
    Primed,
    Running,
    Logged,
    Synced,
    Completed,
    Flushing,
    Dead,
}

#[derive(Debug, Default)]
pub struct CommitWaiter {
    pub done: AtomicBool,
}

pub struct TxnEntry {
    pub xid: TransactionId,
    pub status: XidStatus,
    pub waiter: Option<Arc<CommitWaiter>>,
}

/// The per-activation cargo of a write group. Taken out wholesale when
/// the group starts RUNNING so the writer can work without the mutex.
pub struct GroupPayload {
    pub buffers: Vec<bool>,
    pub logged: Vec<bool>,
    pub release: Vec<u32>,
    pub tags: Vec<BufferTag>,
    pub trans: Vec<TxnEntry>,
    pub dotransaction: bool,
    pub trans_friendly: bool,
    pub loggable: bool,
    pub flush_run: bool,
    pub snapshot: Option<String>,
}

impl GroupPayload {
    pub fn new(nbuffers: usize) -> GroupPayload {
        GroupPayload {
            buffers: vec![false; nbuffers],
            logged: vec![false; nbuffers],
            release: vec![0; nbuffers],
            tags: vec![BufferTag::clear(); nbuffers],
            trans: Vec::new(),
            dotransaction: true,
            trans_friendly: true,
            loggable: true,
            flush_run: false,
            snapshot: None,
        }
    }
}

pub struct WriteGroup {
    pub state: GroupState,
    pub payload: GroupPayload,
    /// Most recent soft-committed xid, inherited across rotations to
    /// serialize soft commits.
    pub last_soft_xid: TransactionId,
    /// Outstanding flush-all request against this group.
    pub flush_run: bool,
}

pub struct GroupSlot {
    pub g: Mutex<WriteGroup>,
    pub gate: Condvar,
    pub broadcaster: Condvar,
}

impl GroupSlot {
    fn new(nbuffers: usize) -> GroupSlot {
        GroupSlot {
            g: Mutex::new(WriteGroup {
                state: GroupState::NotReady,
                payload: GroupPayload::new(nbuffers),
                last_soft_xid: INVALID_XID,
                flush_run: false,
            }),
            gate: Condvar::new(),
            broadcaster: Condvar::new(),
        }
    }
}

pub struct WriterShared {
    pub slots: [GroupSlot; 2],
    current: AtomicUsize,
    stopped: AtomicBool,
    nbuffers: usize,
    maxtrans: usize,
    timeout: Duration,
    sync_timeout: Duration,
    max_logcount: usize,
    logging: bool,
}

impl WriterShared {
    pub fn new(cfg: &DbConfig) -> WriterShared {
        WriterShared {
            slots: [GroupSlot::new(cfg.buffers), GroupSlot::new(cfg.buffers)],
            current: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            nbuffers: cfg.buffers,
            maxtrans: cfg.max_trans_per_group,
            timeout: Duration::from_millis(cfg.timeout_ms),
            sync_timeout: Duration::from_millis(cfg.sync_timeout_ms),
            max_logcount: cfg.effective_max_logcount(),
            logging: cfg.logging,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn logging(&self) -> bool {
        self.logging
    }

    /// Lock the current write group in an acceptable state. Spins over
    /// the rotation: the sibling becomes available as soon as the
    /// writer advances the queue.
    fn lock_current(&self, for_commit: bool) -> (usize, parking_lot::MutexGuard<'_, WriteGroup>) {
        loop {
            let i = self.current.load(Ordering::Acquire);
            let g = self.slots[i].g.lock();
            if self.current.load(Ordering::Acquire) != i {
                drop(g);
                continue;
            }
            let busy = matches!(
                g.state,
                GroupState::Running
                    | GroupState::Logged
                    | GroupState::Synced
                    | GroupState::Completed
                    | GroupState::Flushing
                    | GroupState::Dead
            );
            if busy || (for_commit && g.payload.trans.len() >= self.maxtrans) {
                drop(g);
                std::thread::yield_now();
                continue;
            }
            return (i, g);
        }
    }

    fn signal(&self, idx: usize, g: &mut WriteGroup) {
        match g.state {
            GroupState::NotReady | GroupState::Completed => g.state = GroupState::Ready,
            GroupState::Waiting => {
                g.state = GroupState::Ready;
                self.slots[idx].gate.notify_one();
            }
            GroupState::Ready | GroupState::Primed => {}
            other => panic!("DBWriter signaled in invalid state {:?}", other),
        }
    }

    /// Register a dirtied frame with the current group. The first
    /// registration takes a writer-owned pin; `release` transfers the
    /// caller's shared pin to the writer.
    pub fn register_buffer_write(&self, pool: &BufferPool, frame: FrameId, release: bool) {
        let (_, mut g) = self.lock_current(false);
        if !g.payload.buffers[frame] {
            if pool.manual_pin(frame, false) {
                g.payload.buffers[frame] = true;
                g.payload.release[frame] += 1;
                g.payload.tags[frame] = pool.tag_of(frame);
            } else {
                panic!(
                    "invalid buffer registered for write: frame {} tag {:?}",
                    frame,
                    pool.tag_of(frame)
                );
            }
        } else {
            let tag = pool.tag_of(frame);
            if tag != g.payload.tags[frame] {
                panic!(
                    "buffer tag changed while registered for write: {:?} vs {:?}",
                    tag, g.payload.tags[frame]
                );
            }
        }
        drop(g);
        if release {
            pool.manual_unpin(frame, true);
        }
    }

    /// Commit-side entry point. Hard commits block until the writer has
    /// logged and flushed the transaction status; soft commits stamp
    /// the status page themselves and serialize on the previous soft
    /// commit. Aborts are stamped directly and never wait.
    pub fn commit(
        &self,
        db: &Database,
        env: &mut Env,
        xid: TransactionId,
        status: XidStatus,
    ) -> Result<()> {
        let careful = env.transaction.commit_type == CommitType::Synced
            || self.is_stopped()
            || !self.logging;

        let (idx, mut g) = self.lock_current(true);
        if g.state == GroupState::Running {
            panic!("commit into running write group");
        }

        let mut setxid = true;
        let mut soft_prev = INVALID_XID;
        if status == XidStatus::Commit {
            if !env.transaction.loggable {
                g.payload.loggable = false;
            }
            if careful {
                let waiter = Arc::new(CommitWaiter::default());
                g.payload.trans.push(TxnEntry {
                    xid,
                    status: XidStatus::Commit,
                    waiter: Some(waiter.clone()),
                });
                self.signal(idx, &mut g);
                while !waiter.done.load(Ordering::Acquire) {
                    self.slots[idx].broadcaster.wait(&mut g);
                }
                setxid = false;
            } else {
                // promotion entry: the writer will overwrite our
                // SOFT_COMMIT with a durable COMMIT on a later pass
                g.payload.trans.push(TxnEntry {
                    xid,
                    status: XidStatus::Commit,
                    waiter: None,
                });
                self.signal(idx, &mut g);
                soft_prev = g.last_soft_xid;
                g.last_soft_xid = xid;
            }
        }
        drop(g);

        if setxid {
            let stamp = if status == XidStatus::Commit {
                XidStatus::SoftCommit
            } else {
                status
            };
            // stamp the status page in place and hand the page to the
            // current group
            let pool = db.pool();
            let buf = db
                .xlog()
                .set_status_keep_pinned(pool, &mut env.buffers, xid, stamp)?;
            let last = env.buffers.private_ref[buf] == 1;
            self.register_buffer_write(pool, buf, last);
            env.buffers.private_ref[buf] -= 1;
            env.buffers.total_pins -= 1;
            pool.dirty(buf);

            if stamp == XidStatus::SoftCommit {
                debug!(xid, prev = soft_prev, "soft commit");
                db.lock_table().wait(soft_prev);
            }
        }

        env.local.sync(db.disk())?;
        Ok(())
    }

    /// Ask the writer to push every dirty frame to disk and wait.
    pub fn flush_all(&self) {
        let (idx, mut g) = self.lock_current(false);
        g.flush_run = true;
        g.payload.flush_run = true;
        g.payload.trans_friendly = false;
        self.signal(idx, &mut g);
        while g.flush_run {
            self.slots[idx].broadcaster.wait(&mut g);
        }
    }

    /// Attach an external snapshot command to the current group and
    /// wait for the group (including its sync) to complete.
    pub fn request_snapshot(
        &self,
        env: &Env,
        cmd: &str,
    ) -> Result<()> {
        let (idx, mut g) = self.lock_current(true);
        if g.payload.snapshot.is_some() {
            return Err(DbError::InvalidState("snapshot already requested".into()));
        }
        let xid = env.transaction.current.xid;
        let waiter = Arc::new(CommitWaiter::default());
        g.payload.snapshot = Some(cmd.to_string());
        g.payload.loggable = false;
        g.payload.trans.push(TxnEntry {
            xid,
            status: XidStatus::Commit,
            waiter: Some(waiter.clone()),
        });
        self.signal(idx, &mut g);
        while !waiter.done.load(Ordering::Acquire) {
            self.slots[idx].broadcaster.wait(&mut g);
        }
        Ok(())
    }

    pub fn shutdown_signal(&self) {
        self.stopped.store(true, Ordering::Release);
        let (idx, mut g) = self.lock_current(false);
        g.payload.trans_friendly = false;
        g.payload.loggable = false;
        self.signal(idx, &mut g);
    }
}

// ============================================================================
// Writer task
// ============================================================================

/// Everything the writer thread needs; no access to backend state.
pub struct WriterCtx {
    pub shared: Arc<WriterShared>,
    pub pool: Arc<BufferPool>,
    pub disk: Arc<DiskManager>,
    pub shadow: Arc<ShadowLog>,
    pub xlog: Arc<TransactionLog>,
    pub var_rel: Arc<Relation>,
    pub sweep: crossbeam::channel::Sender<crate::poolsweep::SweepRequest>,
    pub vacuum_threshold: f64,
}

struct PathCache {
    file: RelFileId,
    db_name: String,
    rel_name: String,
    accesses: f64,
    tolerance: f64,
    idle_count: u32,
    commit: bool,
    keepstats: bool,
}

pub fn run(ctx: WriterCtx) {
    let mut env = Env::new(
        u64::MAX,
        crate::common::DEFAULT_DB_OID,
        "system",
        ctx.pool.nframes(),
        CommitType::Synced,
    );
    env.is_writer = true;

    let nbuffers = ctx.shared.nbuffers;
    let mut sync_accum = GroupPayload::new(nbuffers);
    let mut sync_count: usize = 0;
    let mut path_cache: HashMap<(Oid, Oid), PathCache> = HashMap::new();
    let mut last: Option<usize> = None;

    info!("DBWriter started");
    loop {
        let idx = match last {
            Some(l) => 1 - l,
            None => ctx.shared.current.load(Ordering::Acquire),
        };
        let slot = &ctx.shared.slots[idx];
        let mut g = slot.g.lock();

        // wait until this group is ready to process
        'check: loop {
            match g.state {
                GroupState::Completed => g.state = GroupState::NotReady,
                GroupState::NotReady => {
                    g.state = GroupState::Waiting;
                    if sync_count > 0 {
                        let res = slot.gate.wait_for(&mut g, ctx.shared.sync_timeout);
                        if res.timed_out() {
                            g.state = GroupState::Primed;
                            g.payload.loggable = false;
                            break 'check;
                        }
                    } else {
                        slot.gate.wait(&mut g);
                    }
                }
                GroupState::Waiting => {
                    slot.gate.wait(&mut g);
                }
                GroupState::Ready => {
                    if g.payload.trans_friendly
                        && !ctx.shared.is_stopped()
                        && g.payload.trans.len() < ctx.shared.maxtrans
                    {
                        g.state = GroupState::Waiting;
                        let res = slot.gate.wait_for(&mut g, ctx.shared.timeout);
                        if res.timed_out() {
                            g.state = GroupState::Primed;
                            break 'check;
                        }
                    } else {
                        break 'check;
                    }
                }
                GroupState::Primed => break 'check,
                GroupState::Flushing => {
                    slot.gate.wait(&mut g);
                }
                other => panic!("DBWriter target group in invalid state {:?}", other),
            }
        }

        // advance the queue: further commits land in the sibling
        {
            let other = 1 - idx;
            let mut og = ctx.shared.slots[other].g.lock();
            match og.state {
                GroupState::Completed | GroupState::NotReady => {
                    og.state = GroupState::NotReady;
                    og.last_soft_xid = g.last_soft_xid;
                }
                other_state => panic!("sibling write group in invalid state {:?}", other_state),
            }
            ctx.shared.current.store(other, Ordering::Release);
        }

        debug_assert!(matches!(g.state, GroupState::Ready | GroupState::Primed));
        g.state = GroupState::Running;
        let mut payload = std::mem::replace(&mut g.payload, GroupPayload::new(nbuffers));
        payload.flush_run |= g.flush_run;
        drop(g);

        ctx.pool.bump_generation();

        // log phase
        if ctx.shared.logging {
            log_buffers(&ctx, &mut payload);
            {
                let mut g = slot.g.lock();
                g.state = GroupState::Logged;
            }
            if payload.dotransaction {
                log_transactions(&ctx, &mut env, &payload.trans);
                payload.dotransaction = false;
            }
            let g = slot.g.lock();
            slot.broadcaster.notify_all();
            drop(g);
        }

        // defer into the sync accumulator, or drain it and sync
        if !payload.flush_run
            && payload.loggable
            && ctx.shared.logging
            && sync_count < ctx.shared.max_logcount
        {
            sync_count += merge_payload(&mut sync_accum, &payload);
        } else {
            if sync_count > 0 {
                merge_payload(&mut payload, &sync_accum);
                sync_accum = GroupPayload::new(nbuffers);
                sync_count = 0;
            }
            sync_buffers(&ctx, &mut payload, &mut path_cache);
            {
                let mut g = slot.g.lock();
                g.state = GroupState::Synced;
            }
            commit_package(&ctx, &mut path_cache);
            if ctx.shared.logging {
                if let Err(e) = ctx.shadow.expirelogs() {
                    warn!(error = %e, "could not expire shadow logs");
                }
            }
            if payload.dotransaction {
                log_transactions(&ctx, &mut env, &payload.trans);
                payload.dotransaction = false;
            }
        }

        // finish
        if let Some(cmd) = payload.snapshot.take() {
            take_filesystem_snapshot(&cmd);
        }
        {
            let mut g = slot.g.lock();
            g.state = GroupState::Completed;
            g.flush_run = false;
            slot.broadcaster.notify_all();
        }
        last = Some(idx);

        if ctx.shared.is_stopped() {
            break;
        }
    }

    // drain: write out anything still deferred, then any group with
    // pending work
    let mut final_payload = GroupPayload::new(nbuffers);
    if sync_count > 0 {
        merge_payload(&mut final_payload, &sync_accum);
    }
    for slot in &ctx.shared.slots {
        let mut g = slot.g.lock();
        let pending = std::mem::replace(&mut g.payload, GroupPayload::new(nbuffers));
        g.state = GroupState::Dead;
        drop(g);
        if ctx.shared.logging {
            let mut p = pending;
            log_buffers(&ctx, &mut p);
            log_transactions(&ctx, &mut env, &p.trans);
            merge_payload(&mut final_payload, &p);
        } else {
            log_transactions(&ctx, &mut env, &pending.trans);
            merge_payload(&mut final_payload, &pending);
        }
        slot.broadcaster.notify_all();
    }
    sync_buffers(&ctx, &mut final_payload, &mut path_cache);
    commit_package(&ctx, &mut path_cache);
    if ctx.shared.logging {
        let _ = ctx.shadow.expirelogs();
    }
    info!("DBWriter stopped");
}

/// Append every registered, still-dirty frame to the shadow log. A
/// frame that lost its dirty bit since registration was coalesced into
/// an earlier pass; its pins are dropped here.
fn log_buffers(ctx: &WriterCtx, payload: &mut GroupPayload) -> usize {
    let mut release_count = 0;
    let mut logged_count = 0;
    ctx.shadow.beginlog();
    for f in 0..payload.buffers.len() {
        if !payload.buffers[f] {
            continue;
        }
        let tag = payload.tags[f];
        if tag.rel == ctx.xlog.rel.id || tag.rel == ctx.var_rel.id {
            // never replayed: these flush through their own path
            continue;
        }
        if ctx.pool.check_buffer_tag(f, tag.block, tag.rel, tag.db) {
            if ctx.pool.log_begin(f) {
                let frame = ctx.pool.frame(f);
                let (kind, db_name, rel_name) = {
                    let cntx = frame.cntx.lock();
                    (
                        cntx.kind,
                        cntx.blind.db_name.clone(),
                        cntx.blind.rel_name.clone(),
                    )
                };
                // safety: this task holds the frame's LOG phase
                let image = unsafe {
                    let page = frame.page_mut();
                    crate::storage::checksum::page_insert_checksum(page);
                    page.to_vec()
                };
                let rec = ShadowRecord {
                    db: tag.db,
                    rel: tag.rel,
                    block: tag.block,
                    kind: kind.as_u8(),
                    db_name,
                    rel_name,
                    image,
                };
                match ctx.shadow.log(&rec) {
                    Ok(()) => {
                        payload.logged[f] = true;
                        logged_count += 1;
                        ctx.pool.terminate_io(f);
                    }
                    Err(e) => {
                        error!(error = %e, "shadow log append failed");
                        ctx.pool.error_io(f);
                    }
                }
            } else if !payload.logged[f] {
                // coalesced: drop the writer-owned pins now, the frame
                // will not transfer to the sync group
                payload.buffers[f] = false;
                while payload.release[f] > 0 {
                    ctx.pool.manual_unpin(f, false);
                    payload.release[f] -= 1;
                    release_count += 1;
                }
            }
        } else {
            warn!(frame = f, ?tag, "registered buffer changed identity before logging");
            if ctx.pool.log_begin(f) {
                ctx.pool.terminate_io(f);
            }
        }
    }
    if let Err(e) = ctx.shadow.commitlog() {
        panic!("shadow log commit failed: {}", e);
    }
    debug!(logged = logged_count, released = release_count, "log phase done");
    release_count
}

/// Stamp every queued transaction status onto its log page, flushing
/// each touched page before waking the transactions waiting on it.
fn log_transactions(ctx: &WriterCtx, env: &mut Env, entries: &[TxnEntry]) {
    if entries.is_empty() {
        return;
    }
    let mut cur: Option<(FrameId, u32)> = None;
    let mut pending_waiters: Vec<Arc<CommitWaiter>> = Vec::new();

    let mut flush_current = |cur: &mut Option<(FrameId, u32)>,
                             pending: &mut Vec<Arc<CommitWaiter>>,
                             env: &mut Env| {
        if let Some((buf, block)) = cur.take() {
            flush_log_page(ctx, env, buf, block);
            for w in pending.drain(..) {
                w.done.store(true, Ordering::Release);
            }
        }
    };

    for entry in entries {
        if entry.xid == INVALID_XID {
            panic!("zero transaction id in write group");
        }
        let block = xid_to_block(entry.xid);
        if cur.map(|(_, b)| b != block).unwrap_or(true) {
            flush_current(&mut cur, &mut pending_waiters, env);
            if let Err(e) = ctx.xlog.ensure_block(block) {
                panic!("cannot extend transaction log: {}", e);
            }
            match ctx.pool.read_buffer(&mut env.buffers, &ctx.xlog.rel, block) {
                Ok(buf) => cur = Some((buf, block)),
                Err(e) => panic!("bad buffer read in transaction logging: {}", e),
            }
        }
        let (buf, _) = cur.unwrap();
        ctx.pool
            .lock_buffer(&mut env.buffers, buf, crate::buffer::LockMode::Exclusive);
        page_set_xid_status(ctx.pool.page_mut(buf), entry.xid, entry.status);
        ctx.pool.unlock_buffer(&mut env.buffers, buf);
        if let Some(w) = &entry.waiter {
            pending_waiters.push(w.clone());
        }
    }
    flush_current(&mut cur, &mut pending_waiters, env);
}

fn flush_log_page(ctx: &WriterCtx, env: &mut Env, buf: FrameId, block: u32) {
    if !ctx.pool.write_begin(buf, WriteMode::Flush) {
        panic!("transaction log page {} rejected flush", block);
    }
    let stable = ctx.pool.advance_buffer_io(buf, true);
    match ctx.xlog.rel.smgr_flush(block, stable) {
        Ok(()) => ctx.pool.terminate_io(buf),
        Err(e) => {
            ctx.pool.error_io(buf);
            panic!("cannot flush transaction log page {}: {}", block, e);
        }
    }
    ctx.pool.release_buffer(&mut env.buffers, buf);
}

/// Fold `src`'s registered frames into `target`, combining release
/// counts. Returns the number of frames moved.
fn merge_payload(target: &mut GroupPayload, src: &GroupPayload) -> usize {
    let mut moved = 0;
    for f in 0..src.buffers.len() {
        if !src.buffers[f] {
            debug_assert_eq!(src.release[f], 0);
            continue;
        }
        moved += 1;
        if !target.buffers[f] {
            target.buffers[f] = true;
            target.tags[f] = src.tags[f];
        }
        if target.tags[f] == src.tags[f] {
            target.release[f] += src.release[f];
            target.logged[f] |= src.logged[f];
        } else {
            warn!(
                frame = f,
                src_tag = ?src.tags[f],
                target_tag = ?target.tags[f],
                "buffer identity mismatch during write group merge"
            );
        }
    }
    moved
}

/// Write every registered frame to its home file. The log and variable
/// relations flush; everything else goes through the per-relation path
/// cache for post-sync bookkeeping.
fn sync_buffers(
    ctx: &WriterCtx,
    payload: &mut GroupPayload,
    path_cache: &mut HashMap<(Oid, Oid), PathCache>,
) -> usize {
    let mut release_count = 0;
    let mut written = 0;
    for f in 0..payload.buffers.len() {
        if !payload.buffers[f] {
            continue;
        }
        let tag = payload.tags[f];
        if ctx.pool.check_buffer_tag(f, tag.block, tag.rel, tag.db) {
            if tag.rel == ctx.xlog.rel.id || tag.rel == ctx.var_rel.id {
                // soft commits leave status pages here; push them out
                if ctx.pool.write_begin(f, WriteMode::Flush) {
                    let stable = ctx.pool.advance_buffer_io(f, true);
                    let file = RelFileId::new(tag.db, tag.rel);
                    match ctx.disk.flush(file, tag.block, stable) {
                        Ok(()) => {
                            written += 1;
                            ctx.pool.terminate_io(f);
                        }
                        Err(e) => {
                            ctx.pool.error_io(f);
                            panic!(
                                "BufferSync: cannot flush block {} of relation {}: {}",
                                tag.block, tag.rel, e
                            );
                        }
                    }
                }
            } else {
                let cache = path_cache_entry(ctx, path_cache, f, tag);
                cache.accesses += payload.release[f] as f64 * cache.tolerance;
                if ctx.pool.write_begin(f, WriteMode::Commit) {
                    cache.commit = true;
                    let stable = ctx.pool.advance_buffer_io(f, false);
                    let file = RelFileId::new(tag.db, tag.rel);
                    match ctx.disk.write(file, tag.block, stable) {
                        Ok(()) => {
                            written += 1;
                            ctx.pool.terminate_io(f);
                        }
                        Err(e) => {
                            ctx.pool.error_io(f);
                            panic!(
                                "BufferSync: cannot write block {} of relation {}: {}",
                                tag.block, tag.rel, e
                            );
                        }
                    }
                }
            }
        } else {
            warn!(frame = f, ?tag, "registered buffer changed identity before sync");
        }
        while payload.release[f] > 0 {
            ctx.pool.manual_unpin(f, false);
            payload.release[f] -= 1;
            release_count += 1;
        }
        payload.buffers[f] = false;
        payload.logged[f] = false;
    }
    debug!(written, released = release_count, "sync phase done");
    release_count
}

fn path_cache_entry<'a>(
    ctx: &WriterCtx,
    path_cache: &'a mut HashMap<(Oid, Oid), PathCache>,
    frame: FrameId,
    tag: BufferTag,
) -> &'a mut PathCache {
    path_cache.entry((tag.db, tag.rel)).or_insert_with(|| {
        let cntx = ctx.pool.frame(frame).cntx.lock();
        PathCache {
            file: RelFileId::new(tag.db, tag.rel),
            db_name: cntx.blind.db_name.clone(),
            rel_name: cntx.blind.rel_name.clone(),
            accesses: 0.0,
            tolerance: 1.0,
            idle_count: 0,
            commit: false,
            keepstats: true,
        }
    })
}

/// Per-relation post-sync bookkeeping: fsync what was written, sample
/// vacuum pressure, close path-cache entries idle for 100 cycles.
fn commit_package(ctx: &WriterCtx, path_cache: &mut HashMap<(Oid, Oid), PathCache>) {
    let nbuffers = ctx.shared.nbuffers as f64;
    let mut closed: Vec<(Oid, Oid)> = Vec::new();
    for (key, cache) in path_cache.iter_mut() {
        if cache.commit {
            if cache.keepstats && cache.accesses > 0.0 {
                let pressure = cache.accesses / (ctx.vacuum_threshold * nbuffers);
                if rand::random::<f64>() < pressure {
                    debug!(rel = %cache.rel_name, accesses = cache.accesses, "vacuum activation");
                    let _ = ctx.sweep.send(crate::poolsweep::SweepRequest::Vacuum {
                        db: key.0,
                        rel: key.1,
                        db_name: cache.db_name.clone(),
                        rel_name: cache.rel_name.clone(),
                    });
                    cache.accesses = 0.0;
                }
            }
            if let Err(e) = ctx.disk.sync(cache.file) {
                panic!("cannot fsync relation {}: {}", cache.rel_name, e);
            }
            cache.commit = false;
            cache.idle_count = 0;
        } else {
            cache.idle_count += 1;
            if cache.idle_count > 100 {
                ctx.disk.close(cache.file);
                closed.push(*key);
            }
        }
    }
    for key in closed {
        path_cache.remove(&key);
    }
}

fn take_filesystem_snapshot(cmd: &str) {
    info!(cmd, "running snapshot command");
    match std::process::Command::new("sh").arg("-c").arg(cmd).status() {
        Ok(status) if status.success() => {}
        Ok(status) => error!(cmd, ?status, "snapshot command failed"),
        Err(e) => error!(cmd, error = %e, "snapshot command could not run"),
    }
}
