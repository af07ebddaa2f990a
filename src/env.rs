// Per-task environment.
//
// Every backend and background task owns one of these; it is threaded
// explicitly through the public calls instead of living in globals.
// It carries the transaction state, the private buffer bookkeeping,
// the local buffer pool, snapshots and the cancel probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::local::LocalBufferPool;
use crate::buffer::BufferEnv;
use crate::common::Oid;
use crate::config::CommitType;
use crate::error::{DbError, Result};
use crate::transaction::snapshot::Snapshot;
use crate::transaction::TransactionInfo;

#[derive(Debug, Default, Clone)]
pub struct SnapshotHolder {
    pub query: Option<Snapshot>,
    pub serializable: Option<Snapshot>,
}

impl SnapshotHolder {
    pub fn clear(&mut self) {
        self.query = None;
        self.serializable = None;
    }
}

pub struct Env {
    pub id: u64,
    pub db: Oid,
    pub db_name: String,
    pub transaction: TransactionInfo,
    pub buffers: BufferEnv,
    pub local: LocalBufferPool,
    pub snapshot: SnapshotHolder,
    /// No-name temporary relations created this transaction, dropped
    /// at commit/abort.
    pub noname_rels: Vec<Oid>,
    pub cancel: Arc<AtomicBool>,
    pub is_writer: bool,
    /// Sub-connections cloned from a parent must stay read-only.
    pub read_only: bool,
}

impl Env {
    pub fn new(
        id: u64,
        db: Oid,
        db_name: &str,
        nframes: usize,
        commit_type: CommitType,
    ) -> Env {
        Env {
            id,
            db,
            db_name: db_name.to_string(),
            transaction: TransactionInfo::new(commit_type),
            buffers: BufferEnv::new(nframes, id),
            local: LocalBufferPool::new(),
            snapshot: SnapshotHolder::default(),
            noname_rels: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            is_writer: false,
            read_only: false,
        }
    }

    /// Handle another task can use to interrupt this one.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Cancellation probe, called at well-known loop tops. Commits are
    /// never interrupted; callers simply stop probing once the commit
    /// pipeline starts.
    pub fn check_for_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(DbError::Canceled);
        }
        Ok(())
    }

    /// Consume a pending cancel (after the abort it provoked).
    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_probe_fires_once_set() {
        let env = Env::new(1, 1, "system", 4, CommitType::Synced);
        assert!(env.check_for_cancel().is_ok());
        env.cancel_handle().store(true, Ordering::Release);
        assert!(matches!(env.check_for_cancel(), Err(DbError::Canceled)));
        env.clear_cancel();
        assert!(env.check_for_cancel().is_ok());
    }
}
