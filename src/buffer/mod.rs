pub mod frame;
pub mod freelist;
pub mod local;
pub mod pool;
pub mod table;

pub use pool::{BufferPool, LockMode, WriteMode};

/// Per-task lock bits, freed in bulk at transaction abort.
pub const BL_R_LOCK: u8 = 1 << 1;
pub const BL_W_LOCK: u8 = 1 << 3;

/// Per-task buffer bookkeeping: the private refcount vector (length =
/// frame count, must be all zero at end of transaction), the context
/// lock bits this task holds, and the dirtied-anything flag.
pub struct BufferEnv {
    pub id: u64,
    pub private_ref: Vec<i64>,
    pub lock_bits: Vec<u8>,
    pub total_pins: i64,
    pub did_write: bool,
}

impl BufferEnv {
    pub fn new(nframes: usize, id: u64) -> BufferEnv {
        BufferEnv {
            id,
            private_ref: vec![0; nframes],
            lock_bits: vec![0; nframes],
            total_pins: 0,
            did_write: false,
        }
    }
}
