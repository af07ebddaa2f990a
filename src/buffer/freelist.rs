// Replacement free list.
//
// Frames whose shared refcount has dropped to zero are queued here in
// FIFO order. A frame is only handed out for replacement when it is
// unpinned, not write-locked and carries no dirty or logged state:
// DBWriter is the only path that clears DIRTY, so a dirty frame must
// stay resident until the writer has dealt with it.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::buffer::frame::BufferDesc;
use crate::buffer::table::BufferTable;
use crate::common::FrameId;

pub struct FreeList {
    queue: Mutex<VecDeque<FrameId>>,
}

impl FreeList {
    pub fn new(nframes: usize) -> FreeList {
        FreeList {
            queue: Mutex::new((0..nframes).collect()),
        }
    }

    /// Return a frame to the free list once its refcount hits zero.
    pub fn put(&self, frames: &[BufferDesc], id: FrameId) {
        let mut queue = self.queue.lock();
        let mut cntx = frames[id].cntx.lock();
        if !cntx.used || cntx.ref_count > 0 {
            return;
        }
        if !cntx.free_listed {
            cntx.free_listed = true;
            queue.push_back(id);
        }
    }

    /// Select a victim. The chosen frame is removed from the tag table
    /// before its tag can be overwritten, its I/O state is reset and it
    /// comes back pinned once (refcount 1, one page access).
    pub fn take(&self, frames: &[BufferDesc], table: &BufferTable) -> Option<FrameId> {
        let mut queue = self.queue.lock();
        let rounds = queue.len();
        for _ in 0..rounds {
            let id = queue.pop_front()?;
            let mut cntx = frames[id].cntx.lock();
            cntx.free_listed = false;

            if cntx.ref_count > 0 || cntx.write_lock {
                // re-pinned since it was freed; drop it from the list
                continue;
            }
            {
                let io = frames[id].io.lock();
                if io.in_progress() || io.dirty || io.logged {
                    cntx.free_listed = true;
                    queue.push_back(id);
                    continue;
                }
            }
            if cntx.resident() && !table.delete(&cntx.tag, id) {
                // table no longer points here; treat as already gone
            }
            cntx.valid = false;
            cntx.deleted = false;
            cntx.used = true;
            cntx.write_lock = false;
            cntx.exclusive = false;
            cntx.critical = false;
            cntx.r_locks = 0;
            cntx.ref_count = 1;
            cntx.page_access = 1;
            cntx.bias = 0;
            drop(cntx);
            frames[id].io.lock().reset();
            return Some(id);
        }
        None
    }

    /// Frame released back without being used (lost an install race).
    pub fn put_back(&self, frames: &[BufferDesc], id: FrameId) {
        {
            let mut cntx = frames[id].cntx.lock();
            debug_assert!(cntx.ref_count == 1);
            cntx.ref_count = 0;
            cntx.page_access = 0;
        }
        self.put(frames, id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<BufferDesc> {
        (0..n).map(BufferDesc::new).collect()
    }

    #[test]
    fn take_pins_the_victim() {
        let frames = frames(2);
        for f in &frames {
            f.cntx.lock().used = true;
        }
        let table = BufferTable::new(2);
        let list = FreeList::new(2);
        let id = list.take(&frames, &table).unwrap();
        let cntx = frames[id].cntx.lock();
        assert_eq!(cntx.ref_count, 1);
        assert_eq!(cntx.page_access, 1);
        assert!(!cntx.valid);
    }

    #[test]
    fn dirty_frames_are_skipped() {
        let frames = frames(2);
        for f in &frames {
            f.cntx.lock().used = true;
        }
        frames[0].io.lock().dirty = true;
        let table = BufferTable::new(2);
        let list = FreeList::new(2);
        let id = list.take(&frames, &table).unwrap();
        assert_eq!(id, 1);
        // frame 0 went back on the list
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let frames = frames(1);
        frames[0].cntx.lock().used = true;
        frames[0].io.lock().dirty = true;
        let table = BufferTable::new(1);
        let list = FreeList::new(1);
        assert!(list.take(&frames, &table).is_none());
    }

    #[test]
    fn put_back_unpins() {
        let frames = frames(1);
        frames[0].cntx.lock().used = true;
        let table = BufferTable::new(1);
        let list = FreeList::new(1);
        let id = list.take(&frames, &table).unwrap();
        list.put_back(&frames, id);
        assert_eq!(frames[0].cntx.lock().ref_count, 0);
        assert_eq!(list.len(), 1);
    }
}
