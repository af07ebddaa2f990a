// Buffer tag table: sharded map from (dbid, relid, blockno) to frame
// index. The shard is chosen by relid so that one relation's chains
// stay on one mutex.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::common::{BufferTag, FrameId};

pub struct BufferTable {
    shards: Vec<Mutex<HashMap<BufferTag, FrameId>>>,
}

impl BufferTable {
    pub fn new(nshards: usize) -> BufferTable {
        let nshards = nshards.max(1);
        BufferTable {
            shards: (0..nshards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, tag: &BufferTag) -> &Mutex<HashMap<BufferTag, FrameId>> {
        &self.shards[tag.rel as usize % self.shards.len()]
    }

    pub fn lookup(&self, tag: &BufferTag) -> Option<FrameId> {
        self.shard(tag).lock().get(tag).copied()
    }

    /// Install `tag -> frame`. Fails when a concurrent insert won the
    /// race; the caller drops its free frame and retries the lookup.
    pub fn insert(&self, tag: BufferTag, frame: FrameId) -> bool {
        let mut shard = self.shard(&tag).lock();
        if shard.contains_key(&tag) {
            return false;
        }
        shard.insert(tag, frame);
        true
    }

    /// Remove a mapping, verifying it still points at `frame`.
    pub fn delete(&self, tag: &BufferTag, frame: FrameId) -> bool {
        let mut shard = self.shard(tag).lock();
        match shard.get(tag) {
            Some(&f) if f == frame => {
                shard.remove(tag);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(rel: u32, block: u32) -> BufferTag {
        BufferTag::new(1, rel, block)
    }

    #[test]
    fn insert_lookup_delete() {
        let t = BufferTable::new(4);
        assert!(t.insert(tag(10, 0), 5));
        assert_eq!(t.lookup(&tag(10, 0)), Some(5));
        assert!(t.delete(&tag(10, 0), 5));
        assert_eq!(t.lookup(&tag(10, 0)), None);
    }

    #[test]
    fn losing_insert_race_fails() {
        let t = BufferTable::new(4);
        assert!(t.insert(tag(10, 0), 5));
        assert!(!t.insert(tag(10, 0), 9));
        assert_eq!(t.lookup(&tag(10, 0)), Some(5));
    }

    #[test]
    fn delete_verifies_frame() {
        let t = BufferTable::new(4);
        assert!(t.insert(tag(3, 7), 1));
        assert!(!t.delete(&tag(3, 7), 2));
        assert_eq!(t.len(), 1);
    }
}
