// Heap tuple layout.
//
// A stored tuple is a 32-byte header with the MVCC fields, an optional
// null bitmap of ceil(natts/8) bytes, then the attribute payload packed
// with per-attribute alignment starting at `hoff` (MAXALIGN-rounded).
// Varlena attributes carry a 4-byte total-size prefix.

use crate::common::{
    AttrKind, CommandId, Datum, ItemPointer, OffsetNumber, ScanKey, TransactionId, TupleDesc,
};
use crate::storage::page::maxalign;

pub const TUPLE_HEADER_SIZE: usize = 32;

// infomask bits
pub const HEAP_HASNULL: u16 = 0x0001;
pub const HEAP_HASVARLENA: u16 = 0x0002;
pub const HEAP_XMAX_INVALID: u16 = 0x0008;
pub const HEAP_XMIN_COMMITTED: u16 = 0x0100;
pub const HEAP_XMIN_INVALID: u16 = 0x0200;
pub const HEAP_XMAX_COMMITTED: u16 = 0x0400;
pub const HEAP_MARKED_FOR_UPDATE: u16 = 0x1000;
pub const HEAP_MOVED_IN: u16 = 0x2000;

// system attribute numbers
pub const ATTR_SELF_CTID: i32 = -1;
pub const ATTR_XMIN: i32 = -2;
pub const ATTR_CMIN: i32 = -3;
pub const ATTR_XMAX: i32 = -4;
pub const ATTR_CMAX: i32 = -5;
pub const ATTR_VTRAN: i32 = -6;

/// Fixed header offsets of the system attributes, indexed by
/// `-attnum - 1`.
pub const SYS_ATTR_OFFSETS: [usize; 6] = [20, 0, 4, 8, 12, 16];

// ============================================================================
// Header accessors over raw tuple bytes
// ============================================================================

macro_rules! u32_field {
    ($get:ident, $set:ident, $off:expr) => {
        #[inline]
        pub fn $get(tup: &[u8]) -> u32 {
            u32::from_le_bytes(tup[$off..$off + 4].try_into().unwrap())
        }
        #[inline]
        pub fn $set(tup: &mut [u8], v: u32) {
            tup[$off..$off + 4].copy_from_slice(&v.to_le_bytes());
        }
    };
}

u32_field!(tuple_get_xmin, tuple_set_xmin, 0);
u32_field!(tuple_get_cmin, tuple_set_cmin, 4);
u32_field!(tuple_get_xmax, tuple_set_xmax, 8);
u32_field!(tuple_get_cmax, tuple_set_cmax, 12);
u32_field!(tuple_get_vtran, tuple_set_vtran, 16);

#[inline]
pub fn tuple_get_ctid(tup: &[u8]) -> ItemPointer {
    ItemPointer::new(
        u32::from_le_bytes(tup[20..24].try_into().unwrap()),
        u16::from_le_bytes(tup[24..26].try_into().unwrap()),
    )
}

#[inline]
pub fn tuple_set_ctid(tup: &mut [u8], tid: ItemPointer) {
    tup[20..24].copy_from_slice(&tid.block.to_le_bytes());
    tup[24..26].copy_from_slice(&tid.offnum.to_le_bytes());
}

#[inline]
pub fn tuple_get_natts(tup: &[u8]) -> u16 {
    u16::from_le_bytes(tup[26..28].try_into().unwrap())
}

#[inline]
pub fn tuple_get_infomask(tup: &[u8]) -> u16 {
    u16::from_le_bytes(tup[28..30].try_into().unwrap())
}

#[inline]
pub fn tuple_set_infomask(tup: &mut [u8], mask: u16) {
    tup[28..30].copy_from_slice(&mask.to_le_bytes());
}

#[inline]
pub fn tuple_get_hoff(tup: &[u8]) -> u16 {
    u16::from_le_bytes(tup[30..32].try_into().unwrap())
}

#[inline]
pub fn tuple_has_nulls(tup: &[u8]) -> bool {
    tuple_get_infomask(tup) & HEAP_HASNULL != 0
}

#[inline]
fn att_isnull(attno: usize, bits: &[u8]) -> bool {
    bits[attno >> 3] & (1 << (attno & 7)) == 0
}

// ============================================================================
// Formation
// ============================================================================

#[inline]
pub fn att_align(off: usize, align: crate::common::AttrAlign) -> usize {
    let a = align.bytes();
    (off + a - 1) & !(a - 1)
}

fn datum_stored_len(attr: &crate::common::AttrDesc, value: &Datum) -> usize {
    if attr.is_varlena() {
        match value {
            Datum::Text(v) => 4 + v.len(),
            other => panic!("varlena attribute with fixed datum {:?}", other),
        }
    } else {
        attr.len as usize
    }
}

/// Size of the attribute payload for a set of values.
pub fn compute_data_size(desc: &TupleDesc, values: &[Datum], nulls: &[bool]) -> usize {
    let mut len = 0;
    for (i, attr) in desc.attrs.iter().enumerate() {
        if nulls[i] {
            continue;
        }
        len = att_align(len, attr.align);
        len += datum_stored_len(attr, &values[i]);
    }
    len
}

fn data_fill(
    data: &mut [u8],
    desc: &TupleDesc,
    values: &[Datum],
    nulls: &[bool],
    infomask: &mut u16,
) {
    let mut off = 0;
    for (i, attr) in desc.attrs.iter().enumerate() {
        if nulls[i] {
            *infomask |= HEAP_HASNULL;
            continue;
        }
        off = att_align(off, attr.align);
        match &values[i] {
            Datum::Char(v) => data[off] = *v,
            Datum::Int2(v) => data[off..off + 2].copy_from_slice(&v.to_le_bytes()),
            Datum::Int4(v) => data[off..off + 4].copy_from_slice(&v.to_le_bytes()),
            Datum::Int8(v) => data[off..off + 8].copy_from_slice(&v.to_le_bytes()),
            Datum::Float8(v) => data[off..off + 8].copy_from_slice(&v.to_le_bytes()),
            Datum::Text(v) => {
                *infomask |= HEAP_HASVARLENA;
                let total = (4 + v.len()) as u32;
                data[off..off + 4].copy_from_slice(&total.to_le_bytes());
                data[off + 4..off + 4 + v.len()].copy_from_slice(v);
            }
        }
        off += datum_stored_len(attr, &values[i]);
    }
}

/// Form a tuple image. MVCC header fields are left zeroed for the
/// caller to stamp.
pub fn heap_form_tuple(desc: &TupleDesc, values: &[Datum], nulls: &[bool]) -> Vec<u8> {
    assert_eq!(values.len(), desc.natts());
    assert_eq!(nulls.len(), desc.natts());

    let has_nulls = nulls.iter().any(|&n| n);
    let bitmap_len = if has_nulls {
        (desc.natts() + 7) / 8
    } else {
        0
    };
    let hoff = maxalign(TUPLE_HEADER_SIZE + bitmap_len);
    let data_len = compute_data_size(desc, values, nulls);

    let mut tup = vec![0u8; hoff + data_len];
    tup[26..28].copy_from_slice(&(desc.natts() as u16).to_le_bytes());
    tup[30..32].copy_from_slice(&(hoff as u16).to_le_bytes());

    if has_nulls {
        for (i, &null) in nulls.iter().enumerate() {
            if !null {
                tup[TUPLE_HEADER_SIZE + (i >> 3)] |= 1 << (i & 7);
            }
        }
    }

    let mut infomask = HEAP_XMAX_INVALID;
    let (head, data) = tup.split_at_mut(hoff);
    data_fill(data, desc, values, nulls, &mut infomask);
    if has_nulls {
        infomask |= HEAP_HASNULL;
    }
    head[28..30].copy_from_slice(&infomask.to_le_bytes());
    tup
}

// ============================================================================
// Extraction
// ============================================================================

fn decode_datum(attr: &crate::common::AttrDesc, bytes: &[u8]) -> Datum {
    match attr.kind {
        AttrKind::Char => Datum::Char(bytes[0]),
        AttrKind::Int2 => Datum::Int2(i16::from_le_bytes(bytes[..2].try_into().unwrap())),
        AttrKind::Int4 => Datum::Int4(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        AttrKind::Int8 => Datum::Int8(i64::from_le_bytes(bytes[..8].try_into().unwrap())),
        AttrKind::Float8 => Datum::Float8(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
        AttrKind::Text => {
            let total = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
            Datum::Text(bytes[4..total].to_vec())
        }
    }
}

#[inline]
fn stored_len_at(attr: &crate::common::AttrDesc, bytes: &[u8]) -> usize {
    if attr.is_varlena() {
        u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize
    } else {
        attr.len as usize
    }
}

/// Extract attribute `attnum` (1-based; negative selects a system
/// attribute). Returns `None` for SQL null.
pub fn heap_get_attr(tup: &[u8], attnum: i32, desc: &TupleDesc) -> Option<Datum> {
    if attnum < 0 {
        return Some(system_attr(tup, attnum));
    }
    assert!(attnum > 0, "zero attnum disallowed");
    let attno = (attnum - 1) as usize;
    if attno >= tuple_get_natts(tup) as usize {
        return None;
    }

    let hoff = tuple_get_hoff(tup) as usize;
    let has_nulls = tuple_has_nulls(tup);
    let bits = &tup[TUPLE_HEADER_SIZE..];
    if has_nulls && att_isnull(attno, bits) {
        return None;
    }

    let data = &tup[hoff..];
    let attr = &desc.attrs[attno];

    // fast path: cached fixed offset (no nulls before it by layout
    // guarantee of the cache)
    if !has_nulls {
        if let Some(off) = desc.cached_offset(attno) {
            return Some(decode_datum(attr, &data[off..]));
        }
    }

    // walk preceding attributes, extending the cache while the layout
    // stays fixed
    let mut off = 0usize;
    let mut cacheable = !has_nulls;
    for i in 0..=attno {
        if has_nulls && att_isnull(i, bits) {
            cacheable = false;
            continue;
        }
        let a = &desc.attrs[i];
        off = att_align(off, a.align);
        if cacheable {
            desc.set_cached_offset(i, off);
        }
        if i == attno {
            return Some(decode_datum(attr, &data[off..]));
        }
        off += stored_len_at(a, &data[off..]);
        if a.is_varlena() {
            // offsets past the first varlena are value-dependent
            cacheable = false;
        }
    }
    unreachable!()
}

fn system_attr(tup: &[u8], attnum: i32) -> Datum {
    match attnum {
        ATTR_SELF_CTID => {
            let tid = tuple_get_ctid(tup);
            Datum::Int8(((tid.block as i64) << 16) | tid.offnum as i64)
        }
        ATTR_XMIN => Datum::Int8(tuple_get_xmin(tup) as i64),
        ATTR_CMIN => Datum::Int8(tuple_get_cmin(tup) as i64),
        ATTR_XMAX => Datum::Int8(tuple_get_xmax(tup) as i64),
        ATTR_CMAX => Datum::Int8(tuple_get_cmax(tup) as i64),
        ATTR_VTRAN => Datum::Int8(tuple_get_vtran(tup) as i64),
        other => panic!("undefined system attribute {}", other),
    }
}

/// Test a tuple against the scan keys. Key order is caller-chosen;
/// evaluation short-circuits on the first failure.
pub fn heap_key_test(tup: &[u8], desc: &TupleDesc, keys: &[ScanKey]) -> bool {
    for key in keys {
        match heap_get_attr(tup, key.attnum as i32, desc) {
            None => return false,
            Some(value) => {
                if !key.op.evaluate(value.compare(&key.arg)) {
                    return false;
                }
            }
        }
    }
    true
}

/// An owned copy of a stored tuple plus its physical location.
#[derive(Debug, Clone)]
pub struct HeapTuple {
    pub data: Vec<u8>,
    pub self_tid: ItemPointer,
}

impl HeapTuple {
    pub fn get_attr(&self, attnum: i32, desc: &TupleDesc) -> Option<Datum> {
        heap_get_attr(&self.data, attnum, desc)
    }

    pub fn xmin(&self) -> TransactionId {
        tuple_get_xmin(&self.data)
    }

    pub fn xmax(&self) -> TransactionId {
        tuple_get_xmax(&self.data)
    }

    pub fn cmin(&self) -> CommandId {
        tuple_get_cmin(&self.data)
    }

    pub fn ctid(&self) -> ItemPointer {
        tuple_get_ctid(&self.data)
    }

    pub fn infomask(&self) -> u16 {
        tuple_get_infomask(&self.data)
    }
}

/// Stamp insertion metadata onto a formed tuple.
pub fn tuple_stamp_insert(
    tup: &mut [u8],
    xid: TransactionId,
    cmdid: CommandId,
    tid: ItemPointer,
) {
    tuple_set_xmin(tup, xid);
    tuple_set_cmin(tup, cmdid);
    tuple_set_xmax(tup, 0);
    tuple_set_cmax(tup, 0);
    tuple_set_ctid(tup, tid);
    let mask = tuple_get_infomask(tup);
    tuple_set_infomask(tup, (mask | HEAP_XMAX_INVALID) & !(HEAP_XMIN_COMMITTED | HEAP_XMIN_INVALID));
}

pub fn item_pointer_from_parts(block: u32, offnum: OffsetNumber) -> ItemPointer {
    ItemPointer::new(block, offnum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{AttrDesc, SkOp};

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![
            AttrDesc::int4("id"),
            AttrDesc::char("flag"),
            AttrDesc::text("name"),
            AttrDesc::int8("big"),
        ])
    }

    fn values() -> Vec<Datum> {
        vec![
            Datum::Int4(7),
            Datum::Char(b'y'),
            Datum::text("hello"),
            Datum::Int8(1 << 40),
        ]
    }

    #[test]
    fn form_and_extract_round_trip() {
        let d = desc();
        let v = values();
        let nulls = vec![false; 4];
        let tup = heap_form_tuple(&d, &v, &nulls);

        assert_eq!(heap_get_attr(&tup, 1, &d), Some(Datum::Int4(7)));
        assert_eq!(heap_get_attr(&tup, 2, &d), Some(Datum::Char(b'y')));
        assert_eq!(heap_get_attr(&tup, 3, &d), Some(Datum::text("hello")));
        assert_eq!(heap_get_attr(&tup, 4, &d), Some(Datum::Int8(1 << 40)));
    }

    #[test]
    fn nulls_produce_bitmap_and_none() {
        let d = desc();
        let v = values();
        let nulls = vec![false, true, false, false];
        let tup = heap_form_tuple(&d, &v, &nulls);

        assert!(tuple_has_nulls(&tup));
        assert_eq!(heap_get_attr(&tup, 2, &d), None);
        assert_eq!(heap_get_attr(&tup, 1, &d), Some(Datum::Int4(7)));
        // attribute after the null still decodes
        assert_eq!(heap_get_attr(&tup, 3, &d), Some(Datum::text("hello")));
        assert_eq!(heap_get_attr(&tup, 4, &d), Some(Datum::Int8(1 << 40)));
    }

    #[test]
    fn alignment_after_varlena() {
        // int8 after an odd-length text forces re-alignment
        let d = TupleDesc::new(vec![AttrDesc::text("t"), AttrDesc::int8("n")]);
        let v = vec![Datum::text("abc"), Datum::Int8(-5)];
        let tup = heap_form_tuple(&d, &v, &[false, false]);
        assert_eq!(heap_get_attr(&tup, 2, &d), Some(Datum::Int8(-5)));
    }

    #[test]
    fn offset_cache_extends_to_first_varlena() {
        let d = desc();
        let tup = heap_form_tuple(&d, &values(), &[false; 4]);
        let _ = heap_get_attr(&tup, 4, &d);
        assert_eq!(d.cached_offset(0), Some(0));
        assert_eq!(d.cached_offset(1), Some(4));
        // text's offset is cacheable (layout before it is fixed) but
        // nothing past it is
        assert_eq!(d.cached_offset(2), Some(8));
        assert_eq!(d.cached_offset(3), None);
    }

    #[test]
    fn system_attributes_come_from_fixed_offsets() {
        let d = desc();
        let mut tup = heap_form_tuple(&d, &values(), &[false; 4]);
        tuple_stamp_insert(&mut tup, 77, 3, ItemPointer::new(2, 5));
        assert_eq!(heap_get_attr(&tup, ATTR_XMIN, &d), Some(Datum::Int8(77)));
        assert_eq!(heap_get_attr(&tup, ATTR_CMIN, &d), Some(Datum::Int8(3)));
        assert_eq!(tuple_get_ctid(&tup), ItemPointer::new(2, 5));
        assert!(tuple_get_infomask(&tup) & HEAP_XMAX_INVALID != 0);
    }

    #[test]
    fn key_test_checks_all_keys() {
        let d = desc();
        let tup = heap_form_tuple(&d, &values(), &[false; 4]);
        let keys = vec![
            ScanKey::new(1, SkOp::Eq, Datum::Int4(7)),
            ScanKey::new(3, SkOp::Eq, Datum::text("hello")),
        ];
        assert!(heap_key_test(&tup, &d, &keys));
        let keys = vec![ScanKey::new(1, SkOp::Gt, Datum::Int4(7))];
        assert!(!heap_key_test(&tup, &d, &keys));
    }
}
