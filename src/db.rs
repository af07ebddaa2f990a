// Database facade.
//
// Owns the storage components, runs startup recovery, spawns DBWriter
// and the poolsweep, and exposes the caller API: relation open/create,
// scans and DML with index maintenance, transaction control, buffer
// surface, flush-all, invalidation, and the maintenance queues.
//
// Buffer identifiers returned from here address either a shared frame
// or, for transaction-private relations, a slot in the calling task's
// local pool (high bit set). All page access goes through this
// dispatch so access methods never care which pool backs them.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::buffer::{BufferPool, LockMode, WriteMode};
use crate::catalog::{self, CatalogIndexDesc, CATALOG_INDEXES};
use crate::common::{
    AttrDesc, BlockNumber, BufferTag, Datum, FrameId, ItemPointer, Oid, RelKind, ScanKey, SkOp,
    TransactionId, TupleDesc, XidStatus, DEFAULT_DB_OID, FIRST_NORMAL_XID, INVALID_XID,
};
use crate::config::DbConfig;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::heap::tuple::HeapTuple;
use crate::heap::{self, HeapResult, HeapScan};
use crate::index::btree;
use crate::poolsweep::Poolsweep;
use crate::relation::{IndexInfo, Relation, RelationCache};
use crate::storage::disk::DiskManager;
use crate::storage::shadow::{RecoveredPage, ShadowLog};
use crate::transaction::locktable::XactLockTable;
use crate::transaction::snapshot::{Snap, Snapshot};
use crate::transaction::xlog::{TransactionLog, VariableRelation};
use crate::writer::{self, WriterCtx, WriterShared};

/// Buffer ids with this bit set address the task-local pool.
const LOCAL_BIT: FrameId = 1 << 62;

/// Counter persistence granularity: one variable-page flush covers this
/// many allocations.
const XID_BATCH: u32 = 64;
const OID_BATCH: u32 = 16;

pub struct Database {
    cfg: DbConfig,
    disk: Arc<DiskManager>,
    shadow: Arc<ShadowLog>,
    pool: Arc<BufferPool>,
    writer: Arc<WriterShared>,
    lock_table: Arc<XactLockTable>,
    relcache: RelationCache,
    xlog: Arc<TransactionLog>,
    var: VariableRelation,
    sweep: Poolsweep,

    next_xid: AtomicU32,
    next_oid: AtomicU32,
    xid_mark: AtomicU32,
    oid_mark: AtomicU32,
    counter_guard: Mutex<()>,

    env_ids: AtomicU64,
    stopped: AtomicBool,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    recovered: Vec<RecoveredPage>,
}

impl Database {
    /// Open (or bootstrap) a database cluster: replay shadow logs,
    /// bring up the buffer pool, the writer and the poolsweep, then
    /// load or create the catalogs.
    pub fn open(cfg: DbConfig) -> Result<Arc<Database>> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        let disk = Arc::new(DiskManager::new(cfg.data_dir.clone())?);
        let shadow = Arc::new(ShadowLog::new(cfg.data_dir.clone()));

        // recovery precedes all user work
        let recovered = shadow.replaylogs(&disk)?;
        if !recovered.is_empty() {
            info!(pages = recovered.len(), "shadow log replay complete");
        }

        let fresh = !disk
            .path_for(crate::storage::disk::RelFileId::new(
                DEFAULT_DB_OID,
                catalog::VARIABLE_RELID,
            ))
            .exists();

        let pool = Arc::new(BufferPool::new(
            cfg.buffers,
            cfg.heap_corruption,
            cfg.index_corruption,
        ));
        let writer = Arc::new(WriterShared::new(&cfg));
        let lock_table = Arc::new(XactLockTable::new());
        let relcache = RelationCache::new();

        let empty = Arc::new(TupleDesc::new(Vec::new()));
        let xlog_rel = Arc::new(Relation::new(
            disk.clone(),
            DEFAULT_DB_OID,
            catalog::XACT_LOG_RELID,
            "system",
            catalog::XACT_LOG_NAME,
            RelKind::Special,
            empty.clone(),
        ));
        let var_rel = Arc::new(Relation::new(
            disk.clone(),
            DEFAULT_DB_OID,
            catalog::VARIABLE_RELID,
            "system",
            catalog::VARIABLE_NAME,
            RelKind::Special,
            empty,
        ));
        if fresh {
            xlog_rel.smgr_create()?;
            var_rel.smgr_create()?;
        }
        relcache.insert(xlog_rel.clone());
        relcache.insert(var_rel.clone());

        let xlog = Arc::new(TransactionLog::new(xlog_rel));
        let var = VariableRelation::new(var_rel.clone());
        let (stored_xid, stored_oid) = var.read_counters()?;
        let next_xid = stored_xid.max(FIRST_NORMAL_XID);
        let next_oid = stored_oid.max(catalog::FIRST_USER_OID);

        let sweep = Poolsweep::new();
        pool.set_sweep(sweep.sender());

        let db = Arc::new(Database {
            cfg,
            disk,
            shadow,
            pool,
            writer,
            lock_table,
            relcache,
            xlog,
            var,
            sweep,
            next_xid: AtomicU32::new(next_xid),
            next_oid: AtomicU32::new(next_oid),
            xid_mark: AtomicU32::new(next_xid),
            oid_mark: AtomicU32::new(next_oid),
            counter_guard: Mutex::new(()),
            env_ids: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            writer_handle: Mutex::new(None),
            recovered,
        });

        db.register_system_catalogs();
        db.spawn_writer();
        db.sweep.spawn(db.clone());

        if fresh {
            db.bootstrap()?;
        } else {
            db.load_catalogs()?;
        }

        // recovered index pages get a consistency pass
        for page in &db.recovered {
            if page.kind == RelKind::Index.as_u8() {
                db.sweep
                    .add_reindex_request(page.db, page.rel, &page.db_name, &page.rel_name);
            }
        }
        Ok(db)
    }

    fn spawn_writer(self: &Arc<Database>) {
        let ctx = WriterCtx {
            shared: self.writer.clone(),
            pool: self.pool.clone(),
            disk: self.disk.clone(),
            shadow: self.shadow.clone(),
            xlog: self.xlog.clone(),
            var_rel: self.var.rel.clone(),
            sweep: self.sweep.sender(),
            vacuum_threshold: self.cfg.vacuum_threshold,
        };
        let handle = std::thread::Builder::new()
            .name("dbwriter".into())
            .spawn(move || writer::run(ctx))
            .expect("could not create db writer");
        *self.writer_handle.lock() = Some(handle);
    }

    /// Stop background tasks and flush everything. New work is refused
    /// once this starts.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("database shutting down");
        self.sweep.shutdown();
        self.writer.shutdown_signal();
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &DbConfig {
        &self.cfg
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    pub fn shadow(&self) -> &ShadowLog {
        &self.shadow
    }

    pub fn lock_table(&self) -> &XactLockTable {
        &self.lock_table
    }

    pub fn relcache(&self) -> &RelationCache {
        &self.relcache
    }

    pub fn xlog(&self) -> &TransactionLog {
        &self.xlog
    }

    pub fn recovered_pages(&self) -> &[RecoveredPage] {
        &self.recovered
    }

    /// A fresh backend environment.
    pub fn create_env(&self) -> Env {
        Env::new(
            self.env_ids.fetch_add(1, Ordering::Relaxed),
            DEFAULT_DB_OID,
            "system",
            self.pool.nframes(),
            self.cfg.commit_type,
        )
    }

    // ========================================================================
    // Transaction identifiers and snapshots
    // ========================================================================

    pub fn alloc_xid(&self, env: &mut Env) -> Result<TransactionId> {
        let xid = self.next_xid.fetch_add(1, Ordering::AcqRel);
        if xid >= self.xid_mark.load(Ordering::Acquire) {
            let _g = self.counter_guard.lock();
            if xid >= self.xid_mark.load(Ordering::Acquire) {
                let mark = xid + XID_BATCH;
                self.var.write_counters(
                    &self.pool,
                    &mut env.buffers,
                    mark,
                    self.oid_mark.load(Ordering::Acquire),
                )?;
                self.xid_mark.store(mark, Ordering::Release);
            }
        }
        Ok(xid)
    }

    pub fn alloc_oid(&self, env: &mut Env) -> Result<Oid> {
        let oid = self.next_oid.fetch_add(1, Ordering::AcqRel);
        if oid >= self.oid_mark.load(Ordering::Acquire) {
            let _g = self.counter_guard.lock();
            if oid >= self.oid_mark.load(Ordering::Acquire) {
                let mark = oid + OID_BATCH;
                self.var.write_counters(
                    &self.pool,
                    &mut env.buffers,
                    self.xid_mark.load(Ordering::Acquire),
                    mark,
                )?;
                self.oid_mark.store(mark, Ordering::Release);
            }
        }
        Ok(oid)
    }

    pub fn xid_status(&self, env: &mut Env, xid: TransactionId) -> Result<XidStatus> {
        if xid == crate::common::BOOTSTRAP_XID {
            return Ok(XidStatus::Commit);
        }
        if xid == INVALID_XID {
            return Ok(XidStatus::Abort);
        }
        self.xlog.get_status(&self.pool, &mut env.buffers, xid)
    }

    pub fn take_snapshot(&self, env: &Env) -> Snapshot {
        Snapshot::new(
            self.lock_table.running_xids(),
            self.next_xid.load(Ordering::Acquire),
            env.transaction.current.xid,
            env.transaction.current.scan_cmdid,
        )
    }

    /// The cached per-statement snapshot, taken on first use.
    pub fn query_snapshot(&self, env: &mut Env) -> Snapshot {
        if let Some(snapshot) = &env.snapshot.query {
            return snapshot.clone();
        }
        let snapshot = self.take_snapshot(env);
        env.snapshot.query = Some(snapshot.clone());
        snapshot
    }

    pub fn oldest_running_xid(&self) -> TransactionId {
        self.lock_table
            .running_xids()
            .into_iter()
            .min()
            .unwrap_or_else(|| self.next_xid.load(Ordering::Acquire))
    }

    pub fn commit_buffer_writes(
        &self,
        env: &mut Env,
        xid: TransactionId,
        status: XidStatus,
    ) -> Result<()> {
        self.writer.commit(self, env, xid, status)
    }

    // ========================================================================
    // Transaction control (delegates to the transaction manager)
    // ========================================================================

    pub fn begin_transaction(&self, env: &mut Env) -> Result<()> {
        crate::transaction::start_transaction(self, env)
    }

    pub fn commit_transaction(&self, env: &mut Env) -> Result<()> {
        crate::transaction::commit_transaction(self, env)
    }

    pub fn abort_transaction(&self, env: &mut Env) -> Result<()> {
        crate::transaction::abort_transaction(self, env)
    }

    pub fn command_counter_increment(&self, env: &mut Env) -> Result<()> {
        crate::transaction::command_counter_increment(env)
    }

    // ========================================================================
    // Buffer surface with local-pool dispatch
    // ========================================================================

    #[inline]
    fn is_local(buf: FrameId) -> bool {
        buf & LOCAL_BIT != 0
    }

    pub fn read_buffer(&self, env: &mut Env, rel: &Relation, block: BlockNumber) -> Result<FrameId> {
        if rel.xact_only {
            let idx = env.local.read(rel, block)?;
            return Ok(LOCAL_BIT | idx);
        }
        match self.pool.read_buffer(&mut env.buffers, rel, block) {
            Err(DbError::Exhausted(_)) if !env.is_writer => {
                // make room and retry once
                self.flush_all();
                self.pool.read_buffer(&mut env.buffers, rel, block)
            }
            other => other,
        }
    }

    pub fn release_buffer(&self, env: &mut Env, buf: FrameId) {
        if Self::is_local(buf) {
            env.local.release(buf & !LOCAL_BIT);
        } else {
            self.pool.release_buffer(&mut env.buffers, buf);
        }
    }

    pub fn lock_page(&self, env: &mut Env, buf: FrameId, mode: LockMode) {
        if !Self::is_local(buf) {
            self.pool.lock_buffer(&mut env.buffers, buf, mode);
        }
    }

    pub fn unlock_page(&self, env: &mut Env, buf: FrameId) {
        if !Self::is_local(buf) {
            self.pool.unlock_buffer(&mut env.buffers, buf);
        }
    }

    pub fn block_of(&self, env: &Env, buf: FrameId) -> BlockNumber {
        if Self::is_local(buf) {
            env.local.slot(buf & !LOCAL_BIT).tag.block
        } else {
            self.pool.block_of(buf)
        }
    }

    /// Page bytes for reading. For local buffers the slice is backed by
    /// the task-private slot, whose address is stable for the life of
    /// the slot.
    pub fn page<'a>(&'a self, env: &Env, buf: FrameId) -> &'a [u8] {
        if Self::is_local(buf) {
            let ptr = env.local.page_ptr(buf & !LOCAL_BIT);
            unsafe { std::slice::from_raw_parts(ptr, crate::storage::page::BLCKSZ) }
        } else {
            self.pool.page(buf)
        }
    }

    /// Page bytes for mutation; caller holds the exclusive-class lock
    /// (shared frames) or simply owns the task (local frames).
    #[allow(clippy::mut_from_ref)]
    pub fn page_mut<'a>(&'a self, env: &Env, buf: FrameId) -> &'a mut [u8] {
        if Self::is_local(buf) {
            let ptr = env.local.page_ptr(buf & !LOCAL_BIT);
            unsafe { std::slice::from_raw_parts_mut(ptr, crate::storage::page::BLCKSZ) }
        } else {
            self.pool.page_mut(buf)
        }
    }

    /// Mark dirty, register with the current write group, release.
    pub fn write_buffer(&self, env: &mut Env, rel: &Relation, buf: FrameId) -> Result<()> {
        if Self::is_local(buf) {
            env.local.mark_dirty(buf & !LOCAL_BIT, true);
            return Ok(());
        }
        env.buffers.did_write = true;
        let last = env.buffers.private_ref[buf] == 1;
        self.writer.register_buffer_write(&self.pool, buf, last);
        env.buffers.private_ref[buf] -= 1;
        env.buffers.total_pins -= 1;
        self.pool.dirty(buf);
        let _ = rel;
        Ok(())
    }

    /// Like `write_buffer` but the caller keeps its pin.
    pub fn write_no_release(&self, env: &mut Env, rel: &Relation, buf: FrameId) -> Result<()> {
        if Self::is_local(buf) {
            env.local.mark_dirty(buf & !LOCAL_BIT, false);
            return Ok(());
        }
        env.buffers.did_write = true;
        self.writer.register_buffer_write(&self.pool, buf, false);
        self.pool.dirty(buf);
        let _ = rel;
        Ok(())
    }

    /// Synchronously drive one frame to disk, bypassing the write
    /// group. Used for status pages during special commits.
    pub fn flush_buffer(&self, env: &mut Env, rel: &Relation, buf: FrameId) -> Result<()> {
        if Self::is_local(buf) {
            env.local.mark_dirty(buf & !LOCAL_BIT, true);
            return env.local.sync(&self.disk);
        }
        let block = self.pool.block_of(buf);
        if !self.pool.write_begin(buf, WriteMode::Flush) {
            self.pool.error_io(buf);
            self.pool.release_buffer(&mut env.buffers, buf);
            return Err(DbError::Io(std::io::Error::other("flush rejected")));
        }
        let stable = self.pool.advance_buffer_io(buf, true);
        let res = rel.smgr_flush(block, stable);
        match res {
            Ok(()) => self.pool.terminate_io(buf),
            Err(_) => self.pool.error_io(buf),
        }
        self.pool.release_buffer(&mut env.buffers, buf);
        res
    }

    /// Status-bit updates mark the page dirty without forcing the
    /// shared-buffer-changed contract onto the transaction.
    pub fn set_commit_info_needs_save(&self, env: &mut Env, buf: FrameId) {
        if Self::is_local(buf) {
            env.local.mark_dirty(buf & !LOCAL_BIT, false);
        } else {
            self.pool.dirty(buf);
        }
    }

    pub fn release_and_read_buffer(
        &self,
        env: &mut Env,
        rel: &Relation,
        cur: Option<FrameId>,
        block: BlockNumber,
    ) -> Result<FrameId> {
        match cur {
            Some(buf) if Self::is_local(buf) => {
                env.local.release(buf & !LOCAL_BIT);
                self.read_buffer(env, rel, block)
            }
            cur => self
                .pool
                .release_and_read_buffer(&mut env.buffers, rel, cur, block),
        }
    }

    pub fn flush_all(&self) {
        self.writer.flush_all();
    }

    pub fn invalidate_relation_buffers(&self, env: &mut Env, rel: &Relation) {
        env.local.forget_relation(rel.db, rel.id);
        self.pool.invalidate_relation_buffers(rel);
    }

    pub fn drop_database_buffers(&self, db: Oid) {
        self.flush_all();
        self.pool.drop_database_buffers(db);
    }

    pub fn request_snapshot(&self, env: &Env, cmd: &str) -> Result<()> {
        self.writer.request_snapshot(env, cmd)
    }

    pub fn add_vacuum_request(&self, db: Oid, rel: Oid, db_name: &str, rel_name: &str) {
        self.sweep.add_vacuum_request(db, rel, db_name, rel_name);
    }

    pub fn add_reindex_request(&self, db: Oid, rel: Oid, db_name: &str, rel_name: &str) {
        self.sweep.add_reindex_request(db, rel, db_name, rel_name);
    }

    // ========================================================================
    // Catalog bootstrap and load
    // ========================================================================

    fn system_heap(&self, id: Oid, name: &str, desc: TupleDesc) -> Arc<Relation> {
        Arc::new(Relation::new(
            self.disk.clone(),
            DEFAULT_DB_OID,
            id,
            "system",
            name,
            RelKind::Heap,
            Arc::new(desc),
        ))
    }

    fn system_index(&self, desc: &CatalogIndexDesc, heap_desc: &TupleDesc) -> Arc<Relation> {
        Arc::new(
            Relation::new(
                self.disk.clone(),
                DEFAULT_DB_OID,
                desc.id,
                "system",
                desc.name,
                RelKind::Index,
                Arc::new(catalog::index_tuple_desc(heap_desc, desc.keyattrs)),
            )
            .with_index(IndexInfo {
                heap: desc.heap,
                keyattrs: desc.keyattrs.to_vec(),
                unique: desc.unique,
            }),
        )
    }

    fn register_system_catalogs(&self) {
        self.relcache.insert(self.system_heap(
            catalog::CLASS_RELID,
            catalog::CLASS_NAME,
            catalog::class_desc(),
        ));
        self.relcache.insert(self.system_heap(
            catalog::ATTRIBUTE_RELID,
            catalog::ATTRIBUTE_NAME,
            catalog::attribute_desc(),
        ));
        self.relcache.insert(self.system_heap(
            catalog::INDEX_RELID,
            catalog::INDEX_CATALOG_NAME,
            catalog::index_catalog_desc(),
        ));
        for desc in CATALOG_INDEXES {
            let heap_desc = if desc.heap == catalog::CLASS_RELID {
                catalog::class_desc()
            } else {
                catalog::attribute_desc()
            };
            self.relcache.insert(self.system_index(desc, &heap_desc));
        }
    }

    fn insert_class_row(&self, env: &mut Env, rel: &Arc<Relation>) -> Result<()> {
        let class = self.relcache.get(DEFAULT_DB_OID, catalog::CLASS_RELID).unwrap();
        let values = vec![
            catalog::oid_datum(rel.id),
            Datum::text(&rel.name),
            Datum::Char(rel.kind.as_u8()),
            Datum::Int2(rel.desc.natts() as i16),
        ];
        let nulls = vec![false; 4];
        let tid = heap::heap_insert(self, env, &class, &values, &nulls)?;
        let tup = heap::heap_fetch(self, env, &class, &Snap::Any, tid)?
            .ok_or_else(|| DbError::Catalog("class row vanished".into()))?;
        catalog::catalog_index_insert(self, env, &class, &tup.data, tid)
    }

    fn insert_attribute_rows(&self, env: &mut Env, rel: &Arc<Relation>) -> Result<()> {
        let attrs = self
            .relcache
            .get(DEFAULT_DB_OID, catalog::ATTRIBUTE_RELID)
            .unwrap();
        for (i, attr) in rel.desc.attrs.iter().enumerate() {
            let values = vec![
                catalog::oid_datum(rel.id),
                Datum::text(&attr.name),
                Datum::Int2((i + 1) as i16),
                Datum::Int4(attr.len),
                Datum::Char(attr.align.as_u8()),
                Datum::Char(catalog::attr_kind_to_char(attr.kind)),
                Datum::Char(if attr.by_val { b't' } else { b'f' }),
            ];
            let nulls = vec![false; 7];
            let tid = heap::heap_insert(self, env, &attrs, &values, &nulls)?;
            let tup = heap::heap_fetch(self, env, &attrs, &Snap::Any, tid)?
                .ok_or_else(|| DbError::Catalog("attribute row vanished".into()))?;
            catalog::catalog_index_insert(self, env, &attrs, &tup.data, tid)?;
        }
        Ok(())
    }

    fn insert_index_row(&self, env: &mut Env, index: &Relation) -> Result<()> {
        let info = index.index.as_ref().unwrap();
        let idxcat = self
            .relcache
            .get(DEFAULT_DB_OID, catalog::INDEX_RELID)
            .unwrap();
        let values = vec![
            catalog::oid_datum(index.id),
            catalog::oid_datum(info.heap),
            Datum::text(&catalog::encode_keyattrs(&info.keyattrs)),
            Datum::Char(if info.unique { b't' } else { b'f' }),
        ];
        let nulls = vec![false; 4];
        heap::heap_insert(self, env, &idxcat, &values, &nulls)?;
        Ok(())
    }

    /// First start: create the catalog files and describe every system
    /// relation in them.
    fn bootstrap(self: &Arc<Database>) -> Result<()> {
        info!("bootstrapping system catalogs");
        let mut env = self.create_env();
        crate::transaction::start_transaction(self, &mut env)?;

        for id in [
            catalog::CLASS_RELID,
            catalog::ATTRIBUTE_RELID,
            catalog::INDEX_RELID,
        ] {
            self.relcache
                .get(DEFAULT_DB_OID, id)
                .unwrap()
                .smgr_create()?;
        }
        for desc in CATALOG_INDEXES {
            let index = self.relcache.get(DEFAULT_DB_OID, desc.id).unwrap();
            index.smgr_create()?;
            btree::bt_metapinit(self, &mut env, &index)?;
        }

        let system_rels: Vec<Arc<Relation>> = [
            catalog::XACT_LOG_RELID,
            catalog::VARIABLE_RELID,
            catalog::CLASS_RELID,
            catalog::ATTRIBUTE_RELID,
            catalog::INDEX_RELID,
        ]
        .iter()
        .chain(CATALOG_INDEXES.iter().map(|d| &d.id))
        .map(|&id| self.relcache.get(DEFAULT_DB_OID, id).unwrap())
        .collect();

        for rel in &system_rels {
            self.insert_class_row(&mut env, rel)?;
            if rel.kind == RelKind::Heap {
                self.insert_attribute_rows(&mut env, rel)?;
            }
            if rel.kind == RelKind::Index {
                self.insert_index_row(&mut env, rel)?;
            }
        }

        crate::transaction::commit_transaction(self, &mut env)
    }

    /// Restart: walk sys_class and rebuild relation handles for user
    /// relations.
    fn load_catalogs(self: &Arc<Database>) -> Result<()> {
        let mut env = self.create_env();
        crate::transaction::start_transaction(self, &mut env)?;
        let snapshot = self.query_snapshot(&mut env);

        let class = self.relcache.get(DEFAULT_DB_OID, catalog::CLASS_RELID).unwrap();
        let mut rows: Vec<(Oid, String, u8)> = Vec::new();
        {
            let mut scan = heap::heap_beginscan(
                self,
                &mut env,
                class.clone(),
                Snap::Mvcc(&snapshot),
                Vec::new(),
            )?;
            while let Some(tup) = heap::heap_getnext(self, &mut env, &mut scan)? {
                let relid = match tup.get_attr(1, &class.desc) {
                    Some(d) => catalog::datum_oid(&d).unwrap_or(0),
                    None => continue,
                };
                let name = match tup.get_attr(2, &class.desc) {
                    Some(Datum::Text(v)) => String::from_utf8_lossy(&v).into_owned(),
                    _ => continue,
                };
                let kind = match tup.get_attr(3, &class.desc) {
                    Some(Datum::Char(c)) => c,
                    _ => b'r',
                };
                rows.push((relid, name, kind));
            }
            heap::heap_endscan(self, &mut env, &mut scan);
        }

        // heaps first so indexes can resolve their base relations
        for (relid, name, kind) in rows.iter().filter(|r| r.0 >= catalog::FIRST_USER_OID) {
            if RelKind::from_u8(*kind) == RelKind::Heap {
                let desc = self.load_attributes(&mut env, *relid)?;
                let rel = Arc::new(Relation::new(
                    self.disk.clone(),
                    DEFAULT_DB_OID,
                    *relid,
                    "system",
                    name,
                    RelKind::Heap,
                    Arc::new(desc),
                ));
                self.relcache.insert(rel);
            }
        }
        for (relid, name, kind) in rows.iter().filter(|r| r.0 >= catalog::FIRST_USER_OID) {
            if RelKind::from_u8(*kind) == RelKind::Index {
                if let Some(rel) = self.load_index(&mut env, *relid, name)? {
                    self.relcache.insert(rel);
                }
            }
        }

        crate::transaction::commit_transaction(self, &mut env)
    }

    fn load_attributes(&self, env: &mut Env, relid: Oid) -> Result<TupleDesc> {
        let attrs_rel = self
            .relcache
            .get(DEFAULT_DB_OID, catalog::ATTRIBUTE_RELID)
            .unwrap();
        let tids = catalog::catalog_index_lookup(
            self,
            env,
            catalog::ATTRIBUTE_RELID_INDEX,
            &[catalog::oid_datum(relid)],
        )?;
        let mut attrs: Vec<(i16, AttrDesc)> = Vec::new();
        for tid in tids {
            let Some(tup) = heap::heap_fetch(self, env, &attrs_rel, &Snap::Any, tid)? else {
                continue;
            };
            let name = match tup.get_attr(2, &attrs_rel.desc) {
                Some(Datum::Text(v)) => String::from_utf8_lossy(&v).into_owned(),
                _ => continue,
            };
            let attnum = match tup.get_attr(3, &attrs_rel.desc) {
                Some(Datum::Int2(n)) => n,
                _ => continue,
            };
            let len = match tup.get_attr(4, &attrs_rel.desc) {
                Some(Datum::Int4(n)) => n,
                _ => continue,
            };
            let align = match tup.get_attr(5, &attrs_rel.desc) {
                Some(Datum::Char(c)) => crate::common::AttrAlign::from_u8(c),
                _ => crate::common::AttrAlign::Int,
            };
            let kind = match tup.get_attr(6, &attrs_rel.desc) {
                Some(Datum::Char(c)) => catalog::attr_kind_from_char(c),
                _ => crate::common::AttrKind::Int4,
            };
            let by_val = matches!(tup.get_attr(7, &attrs_rel.desc), Some(Datum::Char(b't')));
            attrs.push((
                attnum,
                AttrDesc {
                    name,
                    kind,
                    len,
                    align,
                    by_val,
                },
            ));
        }
        attrs.sort_by_key(|(n, _)| *n);
        Ok(TupleDesc::new(attrs.into_iter().map(|(_, a)| a).collect()))
    }

    fn load_index(
        &self,
        env: &mut Env,
        relid: Oid,
        name: &str,
    ) -> Result<Option<Arc<Relation>>> {
        let idxcat = self
            .relcache
            .get(DEFAULT_DB_OID, catalog::INDEX_RELID)
            .unwrap();
        let keys = vec![ScanKey::new(1, SkOp::Eq, catalog::oid_datum(relid))];
        let mut scan = heap::heap_beginscan(self, env, idxcat.clone(), Snap::Any, keys)?;
        let row = heap::heap_getnext(self, env, &mut scan)?;
        heap::heap_endscan(self, env, &mut scan);
        let Some(row) = row else {
            warn!(relid, "index without sys_index row");
            return Ok(None);
        };
        let heap_oid = match row.get_attr(2, &idxcat.desc) {
            Some(d) => catalog::datum_oid(&d).unwrap_or(0),
            None => return Ok(None),
        };
        let keyattrs = match row.get_attr(3, &idxcat.desc) {
            Some(Datum::Text(v)) => catalog::decode_keyattrs(&String::from_utf8_lossy(&v)),
            _ => return Ok(None),
        };
        let unique = matches!(row.get_attr(4, &idxcat.desc), Some(Datum::Char(b't')));
        let Some(heap_rel) = self.relcache.get(DEFAULT_DB_OID, heap_oid) else {
            warn!(relid, heap_oid, "index over unknown heap");
            return Ok(None);
        };
        Ok(Some(Arc::new(
            Relation::new(
                self.disk.clone(),
                DEFAULT_DB_OID,
                relid,
                "system",
                name,
                RelKind::Index,
                Arc::new(catalog::index_tuple_desc(&heap_rel.desc, &keyattrs)),
            )
            .with_index(IndexInfo {
                heap: heap_oid,
                keyattrs,
                unique,
            }),
        )))
    }

    // ========================================================================
    // DDL
    // ========================================================================

    /// Create a heap relation and its catalog entries. Caller is inside
    /// a transaction.
    pub fn create_relation(
        &self,
        env: &mut Env,
        name: &str,
        desc: TupleDesc,
    ) -> Result<Arc<Relation>> {
        if self.relcache.get_by_name(DEFAULT_DB_OID, name).is_some() {
            return Err(DbError::Catalog(format!("relation {} already exists", name)));
        }
        let oid = self.alloc_oid(env)?;
        let rel = Arc::new(Relation::new(
            self.disk.clone(),
            DEFAULT_DB_OID,
            oid,
            "system",
            name,
            RelKind::Heap,
            Arc::new(desc),
        ));
        rel.smgr_create()?;
        self.insert_class_row(env, &rel)?;
        self.insert_attribute_rows(env, &rel)?;
        self.relcache.insert(rel.clone());
        Ok(rel)
    }

    /// Create a transaction-private relation, dropped at end of
    /// transaction.
    pub fn create_temp_relation(
        &self,
        env: &mut Env,
        name: &str,
        desc: TupleDesc,
    ) -> Result<Arc<Relation>> {
        let oid = self.alloc_oid(env)?;
        let rel = Arc::new(
            Relation::new(
                self.disk.clone(),
                DEFAULT_DB_OID,
                oid,
                "system",
                name,
                RelKind::Heap,
                Arc::new(desc),
            )
            .as_temp(),
        );
        rel.smgr_create()?;
        env.noname_rels.push(oid);
        self.relcache.insert(rel.clone());
        Ok(rel)
    }

    /// Create and build a B-tree index over `heap`.
    pub fn create_index(
        &self,
        env: &mut Env,
        name: &str,
        heap: &Arc<Relation>,
        keyattrs: Vec<u16>,
        unique: bool,
    ) -> Result<Arc<Relation>> {
        let oid = self.alloc_oid(env)?;
        let rel = Arc::new(
            Relation::new(
                self.disk.clone(),
                DEFAULT_DB_OID,
                oid,
                "system",
                name,
                RelKind::Index,
                Arc::new(catalog::index_tuple_desc(&heap.desc, &keyattrs)),
            )
            .with_index(IndexInfo {
                heap: heap.id,
                keyattrs,
                unique,
            }),
        );
        rel.smgr_create()?;
        self.insert_class_row(env, &rel)?;
        self.insert_index_row(env, &rel)?;
        self.relcache.insert(rel.clone());
        btree::build::btbuild(self, env, heap, &rel, unique, true)?;
        Ok(rel)
    }

    pub fn open_relation(&self, name: &str) -> Result<Arc<Relation>> {
        self.relcache
            .get_by_name(DEFAULT_DB_OID, name)
            .ok_or_else(|| DbError::Catalog(format!("relation {} does not exist", name)))
    }

    pub fn open_relation_id(&self, db: Oid, id: Oid) -> Result<Arc<Relation>> {
        self.relcache
            .get(db, id)
            .ok_or_else(|| DbError::Catalog(format!("relation {} does not exist", id)))
    }

    /// Indexes defined over a heap.
    pub fn indexes_of(&self, rel: &Relation) -> Vec<Arc<Relation>> {
        self.relcache
            .all()
            .into_iter()
            .filter(|r| {
                r.kind == RelKind::Index
                    && r.index.as_ref().map(|i| i.heap) == Some(rel.id)
            })
            .collect()
    }

    /// Drop the no-name temporary relations of this transaction.
    pub fn drop_noname_rels(&self, env: &mut Env) -> Result<()> {
        let oids = std::mem::take(&mut env.noname_rels);
        for oid in oids {
            if let Some(rel) = self.relcache.get(env.db, oid) {
                env.local.forget_relation(rel.db, rel.id);
                rel.smgr_unlink()?;
                self.relcache.remove(rel.db, rel.id);
            }
        }
        Ok(())
    }

    // ========================================================================
    // DML with index maintenance
    // ========================================================================

    pub fn insert(
        &self,
        env: &mut Env,
        rel: &Arc<Relation>,
        values: &[Datum],
        nulls: &[bool],
    ) -> Result<ItemPointer> {
        let tid = heap::heap_insert(self, env, rel, values, nulls)?;
        self.maintain_indexes(env, rel, tid)?;
        Ok(tid)
    }

    fn maintain_indexes(&self, env: &mut Env, rel: &Arc<Relation>, tid: ItemPointer) -> Result<()> {
        let indexes = self.indexes_of(rel);
        if indexes.is_empty() {
            return Ok(());
        }
        let tup = heap::heap_fetch(self, env, rel, &Snap::Any, tid)?
            .ok_or_else(|| DbError::Storage("inserted tuple vanished".into()))?;
        for index in indexes {
            let Some(info) = index.index.as_ref() else { continue };
            let key = btree::build::build_index_key(rel, &info.keyattrs, &tup.data);
            btree::insert::bt_doinsert(self, env, &index, Some(rel.as_ref()), &key, tid, info.unique)?;
        }
        Ok(())
    }

    pub fn delete(&self, env: &mut Env, rel: &Arc<Relation>, tid: ItemPointer) -> Result<HeapResult> {
        heap::heap_delete(self, env, rel, tid)
    }

    pub fn update(
        &self,
        env: &mut Env,
        rel: &Arc<Relation>,
        otid: ItemPointer,
        values: &[Datum],
        nulls: &[bool],
    ) -> Result<(HeapResult, Option<ItemPointer>)> {
        let (res, ntid) = heap::heap_update(self, env, rel, otid, values, nulls)?;
        if let Some(ntid) = ntid {
            self.maintain_indexes(env, rel, ntid)?;
        }
        Ok((res, ntid))
    }

    /// Open an MVCC scan under the statement snapshot.
    pub fn begin_scan(
        &self,
        env: &mut Env,
        rel: &Arc<Relation>,
        keys: Vec<ScanKey>,
    ) -> Result<HeapScan> {
        let snapshot = self.query_snapshot(env);
        heap::heap_beginscan(self, env, rel.clone(), Snap::Mvcc(&snapshot), keys)
    }

    pub fn scan_next(&self, env: &mut Env, scan: &mut HeapScan) -> Result<Option<HeapTuple>> {
        heap::heap_getnext(self, env, scan)
    }

    pub fn end_scan(&self, env: &mut Env, scan: &mut HeapScan) {
        heap::heap_endscan(self, env, scan)
    }

    // ========================================================================
    // Maintenance (poolsweep entry points)
    // ========================================================================

    /// Reclaim a heap: bulk-delete dead TIDs from every index, then
    /// retire their line pointers.
    pub fn vacuum_relation(self: &Arc<Database>, env: &mut Env, db: Oid, relid: Oid) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let rel = match self.relcache.get(db, relid) {
            Some(r) if r.kind == RelKind::Heap => r,
            _ => return Ok(()),
        };
        crate::transaction::start_transaction(self, env)?;
        env.transaction.loggable = false;
        let outcome = self.vacuum_guts(env, &rel);
        match outcome {
            Ok(removed) => {
                info!(rel = %rel.name, removed, "vacuum complete");
                crate::transaction::commit_transaction(self, env)
            }
            Err(e) => {
                warn!(rel = %rel.name, error = %e, "vacuum failed");
                crate::transaction::abort_transaction(self, env)?;
                Err(e)
            }
        }
    }

    fn vacuum_guts(self: &Arc<Database>, env: &mut Env, rel: &Arc<Relation>) -> Result<u64> {
        let cur_xid = crate::transaction::current_xid(env);
        let oldest = self.oldest_running_xid();

        let mut dead: Vec<ItemPointer> = Vec::new();
        let mut scan = heap::heap_beginscan(self, env, rel.clone(), Snap::Any, Vec::new())?;
        while let Some(tup) = heap::heap_getnext(self, env, &mut scan)? {
            env.check_for_cancel()?;
            let status =
                crate::heap::visibility::tuple_satisfies_vacuum(self, env, &tup.data, cur_xid, oldest)?;
            if matches!(
                status,
                crate::heap::visibility::VacuumStatus::Dead
                    | crate::heap::visibility::VacuumStatus::Stillborn
            ) {
                dead.push(tup.self_tid);
            }
        }
        heap::heap_endscan(self, env, &mut scan);

        if dead.is_empty() {
            return Ok(0);
        }

        for index in self.indexes_of(rel) {
            let mut tids = dead.clone();
            btree::bulkdelete::btbulkdelete(self, env, &index, &mut tids)?;
        }

        for tid in &dead {
            let buf = self.read_buffer(env, rel, tid.block)?;
            self.lock_page(env, buf, LockMode::Exclusive);
            crate::storage::page::page_mark_item_unused(self.page_mut(env, buf), tid.offnum);
            self.unlock_page(env, buf);
            env.transaction.shared_buffer_changed = true;
            self.write_buffer(env, rel, buf)?;
        }
        Ok(dead.len() as u64)
    }

    /// Consistency pass over every page of one index.
    pub fn reindex_relation(self: &Arc<Database>, env: &mut Env, db: Oid, relid: Oid) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let index = match self.relcache.get(db, relid) {
            Some(r) if r.kind == RelKind::Index => r,
            _ => return Ok(()),
        };
        let heap = index
            .index
            .as_ref()
            .and_then(|i| self.relcache.get(db, i.heap));
        crate::transaction::start_transaction(self, env)?;
        env.transaction.loggable = false;
        let outcome = (|| -> Result<()> {
            let nblocks = index.nblocks()?;
            for block in 1..nblocks {
                env.check_for_cancel()?;
                btree::recover::btrecoverpage(self, env, &index, heap.as_ref(), block)?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                info!(index = %index.name, "reindex pass complete");
                crate::transaction::commit_transaction(self, env)
            }
            Err(e) => {
                warn!(index = %index.name, error = %e, "reindex pass failed");
                crate::transaction::abort_transaction(self, env)?;
                Err(e)
            }
        }
    }

    /// Tag checks used by tests and debugging tools.
    pub fn buffer_tag(&self, buf: FrameId) -> Option<BufferTag> {
        if Self::is_local(buf) {
            None
        } else {
            Some(self.pool.tag_of(buf))
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}
