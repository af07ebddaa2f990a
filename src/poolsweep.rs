// Poolsweep: background vacuum / reindex worker.
//
// DBWriter's commit phase enqueues vacuum requests when a relation's
// accumulated commit pressure crosses its threshold; corrupted index
// reads enqueue reindex requests. The worker dedupes bursts and runs
// each request in its own transaction.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::common::Oid;
use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SweepRequest {
    Vacuum {
        db: Oid,
        rel: Oid,
        db_name: String,
        rel_name: String,
    },
    Reindex {
        db: Oid,
        rel: Oid,
        db_name: String,
        rel_name: String,
    },
    Shutdown,
}

pub struct Poolsweep {
    tx: Sender<SweepRequest>,
    rx: Receiver<SweepRequest>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Poolsweep {
    pub fn new() -> Poolsweep {
        let (tx, rx) = unbounded();
        Poolsweep {
            tx,
            rx,
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn sender(&self) -> Sender<SweepRequest> {
        self.tx.clone()
    }

    pub fn add_vacuum_request(&self, db: Oid, rel: Oid, db_name: &str, rel_name: &str) {
        let _ = self.tx.send(SweepRequest::Vacuum {
            db,
            rel,
            db_name: db_name.to_string(),
            rel_name: rel_name.to_string(),
        });
    }

    pub fn add_reindex_request(&self, db: Oid, rel: Oid, db_name: &str, rel_name: &str) {
        let _ = self.tx.send(SweepRequest::Reindex {
            db,
            rel,
            db_name: db_name.to_string(),
            rel_name: rel_name.to_string(),
        });
    }

    pub fn spawn(&self, database: Arc<Database>) {
        let rx = self.rx.clone();
        let handle = std::thread::Builder::new()
            .name("poolsweep".into())
            .spawn(move || worker(database, rx))
            .expect("could not spawn poolsweep");
        *self.handle.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SweepRequest::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for Poolsweep {
    fn default() -> Self {
        Self::new()
    }
}

fn worker(db: Arc<Database>, rx: Receiver<SweepRequest>) {
    let mut env = db.create_env();
    info!("poolsweep started");
    let mut seen: HashSet<SweepRequest> = HashSet::new();
    while let Ok(req) = rx.recv() {
        if req == SweepRequest::Shutdown {
            break;
        }
        // collapse a burst of identical requests
        if !seen.insert(req.clone()) {
            continue;
        }
        while let Ok(extra) = rx.try_recv() {
            if extra == SweepRequest::Shutdown {
                info!("poolsweep stopped");
                return;
            }
            seen.insert(extra);
        }
        let batch: Vec<SweepRequest> = seen.drain().collect();
        for req in batch {
            let outcome = match &req {
                SweepRequest::Vacuum { db: dbid, rel, rel_name, .. } => {
                    info!(rel = rel_name, "poolsweep vacuum");
                    db.vacuum_relation(&mut env, *dbid, *rel)
                }
                SweepRequest::Reindex { db: dbid, rel, rel_name, .. } => {
                    info!(rel = rel_name, "poolsweep reindex");
                    db.reindex_relation(&mut env, *dbid, *rel)
                }
                SweepRequest::Shutdown => unreachable!(),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "poolsweep request failed");
            }
        }
    }
    info!("poolsweep stopped");
}
