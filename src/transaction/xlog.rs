// Transaction-status log and the variable relation.
//
// The log relation is a raw block array of 2-bit status entries indexed
// by xid; it flows through the normal buffer machinery and thus
// inherits its locking and writeout behavior. The variable relation
// holds the persistent next-xid / next-oid counters in block 0.

use std::sync::Arc;

use crate::buffer::{BufferEnv, BufferPool, LockMode};
use crate::common::{BlockNumber, TransactionId, XidStatus};
use crate::error::Result;
use crate::relation::Relation;
use crate::storage::page::BLCKSZ;

/// Four xids per byte.
pub const XIDS_PER_BLOCK: u32 = (BLCKSZ * 4) as u32;

#[inline]
pub fn xid_to_block(xid: TransactionId) -> BlockNumber {
    xid / XIDS_PER_BLOCK
}

#[inline]
fn xid_to_byte(xid: TransactionId) -> usize {
    ((xid % XIDS_PER_BLOCK) / 4) as usize
}

#[inline]
fn xid_to_shift(xid: TransactionId) -> u32 {
    (xid % 4) * 2
}

/// Read a status straight off a log page.
pub fn page_get_xid_status(page: &[u8], xid: TransactionId) -> XidStatus {
    let bits = page[xid_to_byte(xid)] >> xid_to_shift(xid);
    XidStatus::from_bits(bits)
}

/// Stamp a status onto a log page. A soft commit never overwrites a
/// hard commit that DBWriter already recorded.
pub fn page_set_xid_status(page: &mut [u8], xid: TransactionId, status: XidStatus) {
    let cur = page_get_xid_status(page, xid);
    if status == XidStatus::SoftCommit && cur == XidStatus::Commit {
        return;
    }
    let byte = xid_to_byte(xid);
    let shift = xid_to_shift(xid);
    page[byte] = (page[byte] & !(0x3 << shift)) | ((status as u8) << shift);
}

pub struct TransactionLog {
    pub rel: Arc<Relation>,
}

impl TransactionLog {
    pub fn new(rel: Arc<Relation>) -> TransactionLog {
        TransactionLog { rel }
    }

    /// Extend the log file with zero blocks until `block` exists.
    pub fn ensure_block(&self, block: BlockNumber) -> Result<()> {
        let zero = vec![0u8; BLCKSZ];
        let mut n = self.rel.nblocks()?;
        while n <= block {
            n = self.rel.smgr_extend(&zero, 1)?;
        }
        Ok(())
    }

    pub fn get_status(
        &self,
        pool: &BufferPool,
        env: &mut BufferEnv,
        xid: TransactionId,
    ) -> Result<XidStatus> {
        self.ensure_block(xid_to_block(xid))?;
        let buf = pool.read_buffer(env, &self.rel, xid_to_block(xid))?;
        pool.lock_buffer(env, buf, LockMode::Share);
        let status = page_get_xid_status(pool.page(buf), xid);
        pool.unlock_buffer(env, buf);
        pool.release_buffer(env, buf);
        Ok(status)
    }

    /// Stamp a status and return the pinned frame so the caller decides
    /// how the page reaches disk (write-group registration for soft
    /// commits and aborts, direct flush inside DBWriter).
    pub fn set_status_keep_pinned(
        &self,
        pool: &BufferPool,
        env: &mut BufferEnv,
        xid: TransactionId,
        status: XidStatus,
    ) -> Result<crate::common::FrameId> {
        self.ensure_block(xid_to_block(xid))?;
        let buf = pool.read_buffer(env, &self.rel, xid_to_block(xid))?;
        pool.lock_buffer(env, buf, LockMode::Exclusive);
        page_set_xid_status(pool.page_mut(buf), xid, status);
        pool.unlock_buffer(env, buf);
        Ok(buf)
    }
}

// ============================================================================
// Variable relation
// ============================================================================

const NEXT_XID_OFFSET: usize = 0;
const NEXT_OID_OFFSET: usize = 4;

pub struct VariableRelation {
    pub rel: Arc<Relation>,
}

impl VariableRelation {
    pub fn new(rel: Arc<Relation>) -> VariableRelation {
        VariableRelation { rel }
    }

    fn ensure_page(&self) -> Result<()> {
        if self.rel.nblocks()? == 0 {
            let zero = vec![0u8; BLCKSZ];
            self.rel.smgr_extend(&zero, 1)?;
        }
        Ok(())
    }

    /// Read `(next_xid, next_oid)` from block 0.
    pub fn read_counters(&self) -> Result<(u32, u32)> {
        self.ensure_page()?;
        let mut page = vec![0u8; BLCKSZ];
        self.rel.smgr_read(0, &mut page)?;
        let xid = u32::from_le_bytes(page[NEXT_XID_OFFSET..NEXT_XID_OFFSET + 4].try_into().unwrap());
        let oid = u32::from_le_bytes(page[NEXT_OID_OFFSET..NEXT_OID_OFFSET + 4].try_into().unwrap());
        Ok((xid, oid))
    }

    /// Persist the counters through the buffer machinery so the page is
    /// flushed with the surrounding commit traffic.
    pub fn write_counters(
        &self,
        pool: &BufferPool,
        env: &mut BufferEnv,
        next_xid: u32,
        next_oid: u32,
    ) -> Result<()> {
        self.ensure_page()?;
        let buf = pool.read_buffer(env, &self.rel, 0)?;
        pool.lock_buffer(env, buf, LockMode::Exclusive);
        let page = pool.page_mut(buf);
        page[NEXT_XID_OFFSET..NEXT_XID_OFFSET + 4].copy_from_slice(&next_xid.to_le_bytes());
        page[NEXT_OID_OFFSET..NEXT_OID_OFFSET + 4].copy_from_slice(&next_oid.to_le_bytes());
        pool.unlock_buffer(env, buf);

        // flush immediately: losing counter advances would hand out
        // duplicate xids after a crash
        if !pool.write_begin(buf, crate::buffer::WriteMode::Flush) {
            pool.error_io(buf);
            pool.release_buffer(env, buf);
            return Err(crate::error::DbError::Io(std::io::Error::other(
                "variable page flush rejected",
            )));
        }
        let stable = pool.advance_buffer_io(buf, true);
        let res = self.rel.smgr_flush(0, stable);
        match res {
            Ok(()) => pool.terminate_io(buf),
            Err(ref _e) => pool.error_io(buf),
        }
        pool.release_buffer(env, buf);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::XidStatus;

    #[test]
    fn status_bits_pack_four_per_byte() {
        let mut page = vec![0u8; BLCKSZ];
        page_set_xid_status(&mut page, 0, XidStatus::Commit);
        page_set_xid_status(&mut page, 1, XidStatus::Abort);
        page_set_xid_status(&mut page, 2, XidStatus::SoftCommit);
        assert_eq!(page_get_xid_status(&page, 0), XidStatus::Commit);
        assert_eq!(page_get_xid_status(&page, 1), XidStatus::Abort);
        assert_eq!(page_get_xid_status(&page, 2), XidStatus::SoftCommit);
        assert_eq!(page_get_xid_status(&page, 3), XidStatus::InProgress);
        // all four live in byte 0
        assert_ne!(page[0], 0);
        assert!(page[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn soft_commit_never_downgrades_hard_commit() {
        let mut page = vec![0u8; BLCKSZ];
        page_set_xid_status(&mut page, 9, XidStatus::Commit);
        page_set_xid_status(&mut page, 9, XidStatus::SoftCommit);
        assert_eq!(page_get_xid_status(&page, 9), XidStatus::Commit);
        // the writer's promotion path is the inverse and must win
        page_set_xid_status(&mut page, 10, XidStatus::SoftCommit);
        page_set_xid_status(&mut page, 10, XidStatus::Commit);
        assert_eq!(page_get_xid_status(&page, 10), XidStatus::Commit);
    }

    #[test]
    fn block_addressing() {
        assert_eq!(xid_to_block(0), 0);
        assert_eq!(xid_to_block(XIDS_PER_BLOCK - 1), 0);
        assert_eq!(xid_to_block(XIDS_PER_BLOCK), 1);
    }
}
