// Shared types used across the storage core: object identifiers, block
// addressing, buffer tags, tuple descriptors and datum values.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Object identifier for databases and relations.
pub type Oid = u32;

pub const INVALID_OID: Oid = 0;

/// The default (and usually only) database.
pub const DEFAULT_DB_OID: Oid = 1;

/// Block number within a relation file.
pub type BlockNumber = u32;

pub const INVALID_BLOCK: BlockNumber = u32::MAX;

/// Sentinel block number meaning "extend the relation by one block".
pub const P_NEW: BlockNumber = u32::MAX;

/// Line pointer index within a page. 1-based; 0 is invalid.
pub type OffsetNumber = u16;

pub const INVALID_OFFSET: OffsetNumber = 0;
pub const FIRST_OFFSET: OffsetNumber = 1;

/// Transaction identifier.
pub type TransactionId = u32;

pub const INVALID_XID: TransactionId = 0;
/// Bootstrap transactions run before the transaction system is up.
pub const BOOTSTRAP_XID: TransactionId = 1;
pub const FIRST_NORMAL_XID: TransactionId = 2;

/// Command identifier within a transaction.
pub type CommandId = u32;

pub const FIRST_COMMAND_ID: CommandId = 1;

/// Index of a shared buffer frame.
pub type FrameId = usize;

/// Commit-log entry states. Two bits per transaction on the log relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidStatus {
    InProgress = 0,
    Commit = 1,
    Abort = 2,
    /// Written by the committing task itself; promoted to `Commit` by
    /// DBWriter at the next commit phase.
    SoftCommit = 3,
}

impl XidStatus {
    #[inline]
    pub fn from_bits(bits: u8) -> XidStatus {
        match bits & 0x3 {
            0 => XidStatus::InProgress,
            1 => XidStatus::Commit,
            2 => XidStatus::Abort,
            _ => XidStatus::SoftCommit,
        }
    }

    /// Treat soft commits as committed for visibility purposes.
    #[inline]
    pub fn is_committed(self) -> bool {
        matches!(self, XidStatus::Commit | XidStatus::SoftCommit)
    }
}

/// Relation kind, recorded per buffer frame so DBWriter and the shadow
/// log can apply per-kind checksum policy without a relcache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelKind {
    Heap,
    Index,
    /// Raw block relations: the transaction log and the variable
    /// relation. Not slotted pages, never checksummed.
    Special,
    Uncataloged,
}

impl RelKind {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            RelKind::Heap => b'r',
            RelKind::Index => b'i',
            RelKind::Special => b's',
            RelKind::Uncataloged => b'u',
        }
    }

    #[inline]
    pub fn from_u8(b: u8) -> RelKind {
        match b {
            b'i' => RelKind::Index,
            b's' => RelKind::Special,
            b'u' => RelKind::Uncataloged,
            _ => RelKind::Heap,
        }
    }
}

/// Identity of a block in the buffer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferTag {
    pub db: Oid,
    pub rel: Oid,
    pub block: BlockNumber,
}

impl BufferTag {
    pub const fn new(db: Oid, rel: Oid, block: BlockNumber) -> BufferTag {
        BufferTag { db, rel, block }
    }

    pub const fn clear() -> BufferTag {
        BufferTag {
            db: INVALID_OID,
            rel: INVALID_OID,
            block: INVALID_BLOCK,
        }
    }
}

/// Physical tuple location: `(blockno, offset)`. Used as the backing
/// pointer in index entries and update chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offnum: OffsetNumber,
}

impl ItemPointer {
    pub const fn new(block: BlockNumber, offnum: OffsetNumber) -> ItemPointer {
        ItemPointer { block, offnum }
    }

    pub const fn invalid() -> ItemPointer {
        ItemPointer {
            block: INVALID_BLOCK,
            offnum: INVALID_OFFSET,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK && self.offnum != INVALID_OFFSET
    }
}

impl Ord for ItemPointer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.block
            .cmp(&other.block)
            .then(self.offnum.cmp(&other.offnum))
    }
}

impl PartialOrd for ItemPointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Datums and tuple descriptors
// ============================================================================

/// Attribute alignment, following the catalog convention:
/// `c` = byte, `s` = 2, `i` = 4, `l`/`d` = 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrAlign {
    Char,
    Short,
    Int,
    Double,
}

impl AttrAlign {
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            AttrAlign::Char => 1,
            AttrAlign::Short => 2,
            AttrAlign::Int => 4,
            AttrAlign::Double => 8,
        }
    }

    pub fn from_u8(b: u8) -> AttrAlign {
        match b {
            b'c' => AttrAlign::Char,
            b's' => AttrAlign::Short,
            b'i' => AttrAlign::Int,
            _ => AttrAlign::Double,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            AttrAlign::Char => b'c',
            AttrAlign::Short => b's',
            AttrAlign::Int => b'i',
            AttrAlign::Double => b'd',
        }
    }
}

/// A single attribute value. Varlena values carry their payload without
/// the 4-byte on-disk size prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Char(u8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Text(Vec<u8>),
}

impl Datum {
    pub fn text(s: &str) -> Datum {
        Datum::Text(s.as_bytes().to_vec())
    }

    /// Ordering used by scan keys and B-tree comparisons. Panics on a
    /// cross-type comparison; descriptors guarantee homogeneity.
    pub fn compare(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Char(a), Datum::Char(b)) => a.cmp(b),
            (Datum::Int2(a), Datum::Int2(b)) => a.cmp(b),
            (Datum::Int4(a), Datum::Int4(b)) => a.cmp(b),
            (Datum::Int8(a), Datum::Int8(b)) => a.cmp(b),
            (Datum::Float8(a), Datum::Float8(b)) => a.total_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (a, b) => panic!("datum type mismatch: {:?} vs {:?}", a, b),
        }
    }
}

/// Storage type of an attribute, driving datum decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Char,
    Int2,
    Int4,
    Int8,
    Float8,
    Text,
}

/// Per-attribute layout description.
#[derive(Debug, Clone)]
pub struct AttrDesc {
    pub name: String,
    pub kind: AttrKind,
    /// Byte length, or -1 for varlena (4-byte size prefix on disk).
    pub len: i32,
    pub align: AttrAlign,
    pub by_val: bool,
}

impl AttrDesc {
    pub fn char(name: &str) -> AttrDesc {
        AttrDesc {
            name: name.into(),
            kind: AttrKind::Char,
            len: 1,
            align: AttrAlign::Char,
            by_val: true,
        }
    }

    pub fn int2(name: &str) -> AttrDesc {
        AttrDesc {
            name: name.into(),
            kind: AttrKind::Int2,
            len: 2,
            align: AttrAlign::Short,
            by_val: true,
        }
    }

    pub fn int4(name: &str) -> AttrDesc {
        AttrDesc {
            name: name.into(),
            kind: AttrKind::Int4,
            len: 4,
            align: AttrAlign::Int,
            by_val: true,
        }
    }

    pub fn int8(name: &str) -> AttrDesc {
        AttrDesc {
            name: name.into(),
            kind: AttrKind::Int8,
            len: 8,
            align: AttrAlign::Double,
            by_val: true,
        }
    }

    pub fn float8(name: &str) -> AttrDesc {
        AttrDesc {
            name: name.into(),
            kind: AttrKind::Float8,
            len: 8,
            align: AttrAlign::Double,
            by_val: true,
        }
    }

    pub fn text(name: &str) -> AttrDesc {
        AttrDesc {
            name: name.into(),
            kind: AttrKind::Text,
            len: -1,
            align: AttrAlign::Int,
            by_val: false,
        }
    }

    #[inline]
    pub fn is_varlena(&self) -> bool {
        self.len < 0
    }
}

/// Tuple descriptor: attribute layouts plus the progressive offset
/// cache. The cache holds the fixed offset of each leading attribute up
/// to (but not past) the first varlena or nullable position observed.
#[derive(Debug)]
pub struct TupleDesc {
    pub attrs: Vec<AttrDesc>,
    cache: Mutex<Vec<Option<usize>>>,
}

impl TupleDesc {
    pub fn new(attrs: Vec<AttrDesc>) -> TupleDesc {
        let mut cache = vec![None; attrs.len()];
        if !attrs.is_empty() {
            // attribute 0 is always at data offset zero
            cache[0] = Some(0);
        }
        TupleDesc {
            attrs,
            cache: Mutex::new(cache),
        }
    }

    #[inline]
    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    pub fn cached_offset(&self, attno: usize) -> Option<usize> {
        self.cache.lock().get(attno).copied().flatten()
    }

    pub fn set_cached_offset(&self, attno: usize, off: usize) {
        let mut cache = self.cache.lock();
        if attno < cache.len() {
            cache[attno] = Some(off);
        }
    }
}

impl Clone for TupleDesc {
    fn clone(&self) -> Self {
        TupleDesc::new(self.attrs.clone())
    }
}

// ============================================================================
// Scan keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl SkOp {
    #[inline]
    pub fn evaluate(self, ord: Ordering) -> bool {
        match self {
            SkOp::Eq => ord == Ordering::Equal,
            SkOp::Ne => ord != Ordering::Equal,
            SkOp::Lt => ord == Ordering::Less,
            SkOp::Le => ord != Ordering::Greater,
            SkOp::Gt => ord == Ordering::Greater,
            SkOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Attribute predicate applied during scans: `attr <op> arg`.
#[derive(Debug, Clone)]
pub struct ScanKey {
    /// 1-based attribute number.
    pub attnum: u16,
    pub op: SkOp,
    pub arg: Datum,
}

impl ScanKey {
    pub fn new(attnum: u16, op: SkOp, arg: Datum) -> ScanKey {
        ScanKey { attnum, op, arg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_pointer_ordering_is_block_major() {
        let a = ItemPointer::new(1, 9);
        let b = ItemPointer::new(2, 1);
        let c = ItemPointer::new(2, 2);
        assert!(a < b && b < c);
    }

    #[test]
    fn xid_status_round_trips_through_bits() {
        for st in [
            XidStatus::InProgress,
            XidStatus::Commit,
            XidStatus::Abort,
            XidStatus::SoftCommit,
        ] {
            assert_eq!(XidStatus::from_bits(st as u8), st);
        }
        assert!(XidStatus::SoftCommit.is_committed());
        assert!(!XidStatus::Abort.is_committed());
    }

    #[test]
    fn datum_compare_handles_text() {
        assert_eq!(
            Datum::text("abc").compare(&Datum::text("abd")),
            Ordering::Less
        );
    }

    #[test]
    fn tuple_desc_caches_first_attribute() {
        let desc = TupleDesc::new(vec![AttrDesc::int4("a"), AttrDesc::text("b")]);
        assert_eq!(desc.cached_offset(0), Some(0));
        assert_eq!(desc.cached_offset(1), None);
    }
}
