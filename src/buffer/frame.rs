// Buffer frames.
//
// Each frame carries two BLCKSZ page images (live and shadow) and two
// mutex/condvar gates: the context gate guarding tag, flags, pin state
// and lock modes, and the I/O gate guarding the I/O phase machine and
// the dirty/logged bits. The page bytes themselves are reached through
// raw accessors whose callers must follow the locking protocol; frame
// state never moves after pool construction.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;

use crate::common::{BufferTag, FrameId, RelKind};
use crate::storage::page::BLCKSZ;

/// A page-sized buffer.
#[repr(C, align(64))]
pub struct PageBuffer {
    data: [u8; BLCKSZ],
}

impl PageBuffer {
    #[inline]
    pub fn new() -> Box<PageBuffer> {
        // zeroed, heap-allocated without a stack copy of 8 KiB
        unsafe {
            let layout = std::alloc::Layout::new::<PageBuffer>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut PageBuffer;
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Blind identity: enough naming to write the frame out without a
/// relation cache entry.
#[derive(Debug, Clone, Default)]
pub struct BlindId {
    pub db_name: String,
    pub rel_name: String,
}

/// Context-side frame state. Guarded by `BufferDesc::cntx`.
#[derive(Debug)]
pub struct CntxState {
    pub tag: BufferTag,
    pub blind: BlindId,
    pub kind: RelKind,

    // location flags
    pub used: bool,
    pub valid: bool,
    pub deleted: bool,
    pub write_lock: bool,
    pub exclusive: bool,
    pub critical: bool,
    /// Currently queued on the replacement free list.
    pub free_listed: bool,

    pub w_owner: u64,
    pub ref_count: u32,
    /// Pins that will actually dereference the page bytes.
    pub page_access: u32,
    pub r_locks: u32,

    pub e_waiting: u32,
    pub w_waiting: u32,
    pub r_waiting: u32,
    pub p_waiting: u32,

    pub bias: u32,
}

impl CntxState {
    fn new() -> CntxState {
        CntxState {
            tag: BufferTag::clear(),
            blind: BlindId::default(),
            kind: RelKind::Heap,
            used: false,
            valid: false,
            deleted: false,
            write_lock: false,
            exclusive: false,
            critical: false,
            free_listed: true,
            w_owner: 0,
            ref_count: 0,
            page_access: 0,
            r_locks: 0,
            e_waiting: 0,
            w_waiting: 0,
            r_waiting: 0,
            p_waiting: 0,
            bias: 0,
        }
    }

    /// Resident means present in the tag table.
    #[inline]
    pub fn resident(&self) -> bool {
        self.valid && !self.deleted
    }
}

/// The I/O phase machine. At most one phase is active per frame; Error
/// is terminal until the frame is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPhase {
    Idle,
    /// A replacement is installing a new tag.
    Inbound,
    Read,
    Log,
    Write,
    Error,
}

#[derive(Debug)]
pub struct IoState {
    pub phase: IoPhase,
    pub dirty: bool,
    pub logged: bool,
    /// Shadow freshness marker, compared against the pool generation.
    pub generation: u64,
}

impl IoState {
    fn new() -> IoState {
        IoState {
            phase: IoPhase::Idle,
            dirty: false,
            logged: false,
            generation: 0,
        }
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        matches!(self.phase, IoPhase::Inbound | IoPhase::Read | IoPhase::Log | IoPhase::Write)
    }

    pub fn reset(&mut self) {
        self.phase = IoPhase::Idle;
        self.dirty = false;
        self.logged = false;
        self.generation = 0;
    }
}

pub struct BufferDesc {
    pub id: FrameId,
    pub cntx: Mutex<CntxState>,
    pub cntx_gate: Condvar,
    pub io: Mutex<IoState>,
    pub io_gate: Condvar,
    data: UnsafeCell<Box<PageBuffer>>,
    shadow: UnsafeCell<Box<PageBuffer>>,
}

// Page bytes are protected by the context/IO gate protocol, not by the
// type system; the descs themselves never move.
unsafe impl Send for BufferDesc {}
unsafe impl Sync for BufferDesc {}

impl BufferDesc {
    pub fn new(id: FrameId) -> BufferDesc {
        BufferDesc {
            id,
            cntx: Mutex::new(CntxState::new()),
            cntx_gate: Condvar::new(),
            io: Mutex::new(IoState::new()),
            io_gate: Condvar::new(),
            data: UnsafeCell::new(PageBuffer::new()),
            shadow: UnsafeCell::new(PageBuffer::new()),
        }
    }

    /// Live page bytes.
    ///
    /// # Safety
    ///
    /// Caller must hold a pin plus a context lock (any mode) for reads,
    /// or be inside an exclusive I/O phase.
    #[inline(always)]
    pub unsafe fn page(&self) -> &[u8] {
        (*self.data.get()).data()
    }

    /// Mutable live page bytes.
    ///
    /// # Safety
    ///
    /// Caller must hold a pin plus an EXCLUSIVE-class context lock, or
    /// be the task performing the frame's active READ phase.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self) -> &mut [u8] {
        (*self.data.get()).data_mut()
    }

    /// Shadow page bytes.
    ///
    /// # Safety
    ///
    /// Caller must hold the frame's active LOG or WRITE phase.
    #[inline(always)]
    pub unsafe fn shadow_page(&self) -> &[u8] {
        (*self.shadow.get()).data()
    }

    /// # Safety
    ///
    /// Caller must hold the io mutex.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn shadow_page_mut(&self) -> &mut [u8] {
        (*self.shadow.get()).data_mut()
    }

    /// Copy live -> shadow.
    ///
    /// # Safety
    ///
    /// Caller must hold the io mutex.
    #[inline]
    pub unsafe fn copy_to_shadow(&self) {
        let src = (*self.data.get()).data().as_ptr();
        let dst = (*self.shadow.get()).data_mut().as_mut_ptr();
        std::ptr::copy_nonoverlapping(src, dst, BLCKSZ);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_state() {
        let desc = BufferDesc::new(3);
        let cntx = desc.cntx.lock();
        assert!(!cntx.resident());
        assert_eq!(cntx.ref_count, 0);
        drop(cntx);
        let io = desc.io.lock();
        assert_eq!(io.phase, IoPhase::Idle);
        assert!(!io.dirty && !io.logged);
    }

    #[test]
    fn shadow_copy_duplicates_live_bytes() {
        let desc = BufferDesc::new(0);
        unsafe {
            desc.page_mut()[17] = 0x77;
            desc.copy_to_shadow();
            assert_eq!(desc.shadow_page()[17], 0x77);
        }
    }
}
