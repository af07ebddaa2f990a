// Transaction lifecycle.
//
// Start / commit / abort plus the block-state machine that maps user
// BEGIN / COMMIT / ROLLBACK onto them. Commit ordering matters: the
// lock-table entry is removed only after the commit record is durable,
// so a concurrent snapshot can never see our rows committed while still
// counting us as running. Aborted transactions never roll pages back;
// visibility rules make their rows invisible.

pub mod locktable;
pub mod snapshot;
pub mod xlog;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::common::{CommandId, TransactionId, XidStatus, FIRST_COMMAND_ID, INVALID_XID};
use crate::config::CommitType;
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Default,
    Start,
    InProgress,
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Not in any transaction.
    Default,
    /// Implicit single-statement transaction.
    Auto,
    /// Inside a user BEGIN block.
    Manual,
    /// Abort resolved at the next command boundary.
    Abort,
    /// Block poisoned; every later operation forces abort.
    AbortOnly,
    /// Commit resolved at the next command boundary.
    Commit,
}

#[derive(Debug, Clone)]
pub struct TransactionState {
    pub xid: TransactionId,
    pub cmdid: CommandId,
    pub scan_cmdid: CommandId,
    pub start_time: DateTime<Utc>,
    pub state: TransState,
    pub block_state: BlockState,
}

impl TransactionState {
    pub fn new() -> TransactionState {
        TransactionState {
            xid: INVALID_XID,
            cmdid: FIRST_COMMAND_ID,
            scan_cmdid: FIRST_COMMAND_ID,
            start_time: Utc::now(),
            state: TransState::Default,
            block_state: BlockState::Default,
        }
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Per-transaction scratch arenas
// ============================================================================

/// Bump arena released wholesale at end of transaction. These exist so
/// transaction teardown is observable, not for allocator performance.
#[derive(Debug)]
pub struct ScratchArena {
    pub name: &'static str,
    buf: Vec<u8>,
    pub allocations: u64,
}

impl ScratchArena {
    pub fn new(name: &'static str) -> ScratchArena {
        ScratchArena {
            name,
            buf: Vec::new(),
            allocations: 0,
        }
    }

    /// Reserve `n` bytes; returns the offset of the reservation.
    pub fn alloc(&mut self, n: usize) -> usize {
        let off = self.buf.len();
        self.buf.resize(off + n, 0);
        self.allocations += 1;
        off
    }

    pub fn bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.allocations = 0;
    }
}

#[derive(Debug, Default)]
pub struct MemoryContexts {
    pub top_transaction: Option<ScratchArena>,
    pub transaction_command: Option<ScratchArena>,
}

/// Per-task transaction bookkeeping.
pub struct TransactionInfo {
    pub current: TransactionState,
    /// Did this transaction dirty any shared buffer? Cleared last thing
    /// at commit/abort.
    pub shared_buffer_changed: bool,
    pub commit_type: CommitType,
    /// Cleared by maintenance work whose writes must not be deferred
    /// into the shadow log.
    pub loggable: bool,
    pub contexts: MemoryContexts,
}

impl TransactionInfo {
    pub fn new(commit_type: CommitType) -> TransactionInfo {
        TransactionInfo {
            current: TransactionState::new(),
            shared_buffer_changed: false,
            commit_type,
            loggable: true,
            contexts: MemoryContexts::default(),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

fn at_start_memory(env: &mut Env) {
    env.transaction.contexts.top_transaction = Some(ScratchArena::new("TopTransaction"));
    env.transaction.contexts.transaction_command = Some(ScratchArena::new("TransactionCommand"));
}

fn at_end_memory(env: &mut Env) {
    env.transaction.contexts.top_transaction = None;
    env.transaction.contexts.transaction_command = None;
}

pub fn current_xid(env: &Env) -> TransactionId {
    env.transaction.current.xid
}

pub fn xact_in_progress(env: &Env) -> bool {
    env.transaction.current.state == TransState::InProgress
}

pub fn is_aborted_block(env: &Env) -> bool {
    matches!(
        env.transaction.current.block_state,
        BlockState::Abort | BlockState::AbortOnly
    )
}

pub fn start_transaction(db: &Database, env: &mut Env) -> Result<()> {
    env.snapshot.clear();
    if env.transaction.current.state == TransState::InProgress {
        warn!("transaction already in progress");
        return Ok(());
    }
    env.transaction.current.state = TransState::Start;

    let xid = db.alloc_xid(env)?;
    env.transaction.current.xid = xid;
    db.lock_table().insert(xid);

    env.transaction.current.cmdid = FIRST_COMMAND_ID;
    env.transaction.current.scan_cmdid = FIRST_COMMAND_ID;
    env.transaction.current.start_time = Utc::now();
    env.transaction.commit_type = db.config().commit_type;
    env.transaction.loggable = true;

    at_start_memory(env);
    env.noname_rels.clear();

    env.transaction.current.state = TransState::InProgress;
    debug!(xid, "transaction started");
    Ok(())
}

fn record_transaction_commit(db: &Database, env: &mut Env) -> Result<()> {
    let xid = env.transaction.current.xid;
    if env.transaction.shared_buffer_changed {
        db.commit_buffer_writes(env, xid, XidStatus::Commit)?;
    } else {
        env.local.sync(db.disk())?;
    }
    Ok(())
}

fn record_transaction_abort(db: &Database, env: &mut Env) -> Result<()> {
    let xid = env.transaction.current.xid;
    if env.transaction.shared_buffer_changed {
        db.commit_buffer_writes(env, xid, XidStatus::Abort)?;
    } else {
        env.local.sync(db.disk())?;
    }
    db.pool().reset(&mut env.buffers);
    Ok(())
}

pub fn commit_transaction(db: &Database, env: &mut Env) -> Result<()> {
    if env.transaction.current.state != TransState::InProgress {
        warn!("commit while not in progress");
    }
    env.transaction.current.state = TransState::Commit;

    db.drop_noname_rels(env)?;

    record_transaction_commit(db, env)?;

    // only now may other tasks stop seeing us as running
    db.lock_table().remove(env.transaction.current.xid);

    at_end_memory(env);
    if db.pool().check_leak(&env.buffers) > 0 {
        db.pool().reset(&mut env.buffers);
    }
    env.local.reset();
    env.snapshot.clear();

    let xid = env.transaction.current.xid;
    env.transaction.current.state = TransState::Default;
    env.transaction.current.xid = INVALID_XID;
    env.transaction.shared_buffer_changed = false;
    debug!(xid, "transaction committed");
    Ok(())
}

pub fn abort_transaction(db: &Database, env: &mut Env) -> Result<()> {
    let state = env.transaction.current.state;
    if state != TransState::InProgress && state != TransState::Start {
        warn!("abort while not in start or in-progress state");
    }
    env.transaction.current.state = TransState::Abort;

    db.pool().unlock_all(&mut env.buffers);
    db.drop_noname_rels(env)?;

    record_transaction_abort(db, env)?;

    db.lock_table().remove(env.transaction.current.xid);

    at_end_memory(env);
    env.local.reset();
    env.snapshot.clear();

    let xid = env.transaction.current.xid;
    env.transaction.current.state = TransState::Default;
    env.transaction.current.xid = INVALID_XID;
    env.transaction.shared_buffer_changed = false;
    info!(xid, "transaction aborted");
    Ok(())
}

/// Bump the command counter so this task sees its own writes on the
/// next statement.
pub fn command_counter_increment(env: &mut Env) -> Result<()> {
    if env.transaction.current.state != TransState::InProgress {
        return Err(DbError::InvalidState("transaction not started".into()));
    }
    env.transaction.current.cmdid = env
        .transaction
        .current
        .cmdid
        .checked_add(1)
        .ok_or_else(|| DbError::InvalidState("command counter overflow".into()))?;
    env.transaction.current.scan_cmdid = env.transaction.current.cmdid;
    // local invalidation: the cached query snapshot no longer reflects
    // our own latest command
    env.snapshot.query = None;
    Ok(())
}

// ============================================================================
// Command / block wrappers
// ============================================================================

pub fn start_transaction_command(db: &Database, env: &mut Env) -> Result<()> {
    match env.transaction.current.block_state {
        BlockState::Default => {
            start_transaction(db, env)?;
            env.transaction.current.block_state = BlockState::Auto;
        }
        BlockState::Manual | BlockState::AbortOnly => {}
        other => {
            warn!(?other, "unexpected block state at command start");
        }
    }
    Ok(())
}

pub fn commit_transaction_command(db: &Database, env: &mut Env) -> Result<()> {
    match env.transaction.current.block_state {
        BlockState::Default => {
            warn!("unexpected default block state at command commit");
            Ok(())
        }
        BlockState::Auto | BlockState::Commit => {
            commit_transaction(db, env)?;
            env.transaction.current.block_state = BlockState::Default;
            Ok(())
        }
        BlockState::Manual => {
            command_counter_increment(env)?;
            if let Some(cmd) = env.transaction.contexts.transaction_command.as_mut() {
                cmd.reset();
            }
            Ok(())
        }
        BlockState::Abort | BlockState::AbortOnly => {
            abort_transaction(db, env)?;
            env.transaction.current.block_state = BlockState::Default;
            Ok(())
        }
    }
}

/// User BEGIN.
pub fn begin_transaction_block(env: &mut Env) {
    if matches!(
        env.transaction.current.block_state,
        BlockState::Manual | BlockState::AbortOnly
    ) {
        warn!("BEGIN: already a transaction in progress");
    }
    env.transaction.current.block_state = BlockState::Manual;
}

/// User COMMIT.
pub fn commit_transaction_block(env: &mut Env) -> Result<()> {
    match env.transaction.current.block_state {
        BlockState::Manual => {
            env.transaction.current.block_state = BlockState::Commit;
            Ok(())
        }
        BlockState::AbortOnly => {
            warn!("COMMIT in abort-only state resolves as abort");
            env.transaction.current.block_state = BlockState::Abort;
            Ok(())
        }
        _ => Err(DbError::InvalidState("COMMIT: no transaction block".into())),
    }
}

/// User ROLLBACK.
pub fn abort_transaction_block(env: &mut Env) {
    match env.transaction.current.block_state {
        BlockState::Manual | BlockState::AbortOnly => {
            env.transaction.current.block_state = BlockState::Abort;
        }
        _ => {
            env.transaction.current.block_state = BlockState::Default;
            warn!("ROLLBACK: no transaction in progress");
        }
    }
}

/// Poison the block after a failed operation.
pub fn set_abort_only(env: &mut Env) {
    match env.transaction.current.block_state {
        BlockState::Auto => env.transaction.current.block_state = BlockState::Abort,
        BlockState::Default => {}
        _ => env.transaction.current.block_state = BlockState::AbortOnly,
    }
}

/// Copy the parent's transaction identity and snapshot into a
/// sub-connection. Both sides must treat the state as read-only.
pub fn clone_parent_transaction(parent: &Env, child: &mut Env) -> Result<()> {
    if !xact_in_progress(parent) {
        return Err(DbError::InvalidState(
            "parent has no transaction to clone".into(),
        ));
    }
    child.transaction.current = parent.transaction.current.clone();
    child.snapshot.query = parent.snapshot.query.clone();
    child.snapshot.serializable = parent.snapshot.serializable.clone();
    child.read_only = true;
    at_start_memory(child);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_arena_accounting() {
        let mut arena = ScratchArena::new("test");
        let a = arena.alloc(16);
        let b = arena.alloc(8);
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        assert_eq!(arena.bytes(), 24);
        assert_eq!(arena.allocations, 2);
        arena.reset();
        assert_eq!(arena.bytes(), 0);
    }

    #[test]
    fn fresh_state_is_default() {
        let s = TransactionState::new();
        assert_eq!(s.state, TransState::Default);
        assert_eq!(s.block_state, BlockState::Default);
        assert_eq!(s.cmdid, FIRST_COMMAND_ID);
    }
}
