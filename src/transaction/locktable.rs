// Xact lock table.
//
// Every running transaction registers its xid at start and removes it
// when its commit or abort record is durable. `wait` blocks while the
// xid is still registered; soft commits use it to serialize on their
// predecessor, heap updates to wait out a conflicting modifier.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

use crate::common::{TransactionId, INVALID_XID};

pub struct XactLockTable {
    running: Mutex<HashSet<TransactionId>>,
    gate: Condvar,
}

impl XactLockTable {
    pub fn new() -> XactLockTable {
        XactLockTable {
            running: Mutex::new(HashSet::new()),
            gate: Condvar::new(),
        }
    }

    pub fn insert(&self, xid: TransactionId) {
        debug_assert_ne!(xid, INVALID_XID);
        self.running.lock().insert(xid);
    }

    pub fn remove(&self, xid: TransactionId) {
        let mut running = self.running.lock();
        running.remove(&xid);
        self.gate.notify_all();
    }

    pub fn is_running(&self, xid: TransactionId) -> bool {
        self.running.lock().contains(&xid)
    }

    /// Block until `xid` is no longer in progress. Waiting on an
    /// invalid or finished xid returns immediately.
    pub fn wait(&self, xid: TransactionId) {
        if xid == INVALID_XID {
            return;
        }
        let mut running = self.running.lock();
        while running.contains(&xid) {
            self.gate.wait(&mut running);
        }
    }

    /// Snapshot of every xid currently in progress.
    pub fn running_xids(&self) -> Vec<TransactionId> {
        let mut xids: Vec<TransactionId> = self.running.lock().iter().copied().collect();
        xids.sort_unstable();
        xids
    }
}

impl Default for XactLockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn insert_remove_visibility() {
        let t = XactLockTable::new();
        t.insert(7);
        assert!(t.is_running(7));
        t.remove(7);
        assert!(!t.is_running(7));
    }

    #[test]
    fn wait_returns_once_removed() {
        let t = Arc::new(XactLockTable::new());
        t.insert(42);
        let t2 = t.clone();
        let waiter = std::thread::spawn(move || t2.wait(42));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        t.remove(42);
        waiter.join().unwrap();
    }

    #[test]
    fn wait_on_invalid_xid_is_noop() {
        let t = XactLockTable::new();
        t.wait(INVALID_XID);
        t.wait(999);
    }
}
