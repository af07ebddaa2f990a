// Index items.
//
// An index tuple is the heap ctid plus a flags/attribute-count word,
// an optional null bitmap, and the key bytes laid out with the same
// per-attribute alignment rules as heap tuples. On internal pages the
// ctid's block number doubles as the downlink.

use std::cmp::Ordering;

use crate::common::{BlockNumber, Datum, ItemPointer, TupleDesc};
use crate::heap::tuple::att_align;
use crate::storage::page::maxalign;

pub const INDEX_TUPLE_HEADER: usize = 8;
pub const INDEX_HASNULL: u16 = 0x8000;

/// Key of an index entry; `None` is a SQL null. Nulls sort greater
/// than non-nulls and equal to each other, a placement rule only.
pub type IndexKey = Vec<Option<Datum>>;

#[inline]
pub fn item_get_tid(item: &[u8]) -> ItemPointer {
    ItemPointer::new(
        u32::from_le_bytes(item[0..4].try_into().unwrap()),
        u16::from_le_bytes(item[4..6].try_into().unwrap()),
    )
}

#[inline]
pub fn item_set_tid(item: &mut [u8], tid: ItemPointer) {
    item[0..4].copy_from_slice(&tid.block.to_le_bytes());
    item[4..6].copy_from_slice(&tid.offnum.to_le_bytes());
}

/// Downlink of an internal-page entry.
#[inline]
pub fn item_get_downlink(item: &[u8]) -> BlockNumber {
    item_get_tid(item).block
}

#[inline]
fn item_info(item: &[u8]) -> u16 {
    u16::from_le_bytes(item[6..8].try_into().unwrap())
}

#[inline]
fn item_natts(item: &[u8]) -> usize {
    (item_info(item) & 0x00FF) as usize
}

#[inline]
fn item_has_nulls(item: &[u8]) -> bool {
    item_info(item) & INDEX_HASNULL != 0
}

fn item_data_start(item: &[u8]) -> usize {
    let bitmap = if item_has_nulls(item) {
        (item_natts(item) + 7) / 8
    } else {
        0
    };
    maxalign(INDEX_TUPLE_HEADER + bitmap)
}

/// Form an index item for `tid` with the given key.
pub fn index_form_item(desc: &TupleDesc, key: &IndexKey, tid: ItemPointer) -> Vec<u8> {
    assert_eq!(key.len(), desc.natts());
    let has_nulls = key.iter().any(|k| k.is_none());
    let bitmap = if has_nulls { (key.len() + 7) / 8 } else { 0 };
    let hoff = maxalign(INDEX_TUPLE_HEADER + bitmap);

    let mut data_len = 0usize;
    for (i, attr) in desc.attrs.iter().enumerate() {
        if let Some(v) = &key[i] {
            data_len = att_align(data_len, attr.align);
            data_len += match v {
                Datum::Text(t) => 4 + t.len(),
                _ => attr.len as usize,
            };
        }
    }

    let mut item = vec![0u8; hoff + data_len];
    item_set_tid(&mut item, tid);
    let mut info = key.len() as u16;
    if has_nulls {
        info |= INDEX_HASNULL;
        for (i, k) in key.iter().enumerate() {
            if k.is_some() {
                item[INDEX_TUPLE_HEADER + (i >> 3)] |= 1 << (i & 7);
            }
        }
    }
    item[6..8].copy_from_slice(&info.to_le_bytes());

    let mut off = hoff;
    for (i, attr) in desc.attrs.iter().enumerate() {
        let Some(v) = &key[i] else { continue };
        off = hoff + att_align(off - hoff, attr.align);
        match v {
            Datum::Char(b) => item[off] = *b,
            Datum::Int2(n) => item[off..off + 2].copy_from_slice(&n.to_le_bytes()),
            Datum::Int4(n) => item[off..off + 4].copy_from_slice(&n.to_le_bytes()),
            Datum::Int8(n) => item[off..off + 8].copy_from_slice(&n.to_le_bytes()),
            Datum::Float8(n) => item[off..off + 8].copy_from_slice(&n.to_le_bytes()),
            Datum::Text(t) => {
                let total = (4 + t.len()) as u32;
                item[off..off + 4].copy_from_slice(&total.to_le_bytes());
                item[off + 4..off + 4 + t.len()].copy_from_slice(t);
            }
        }
        off += match v {
            Datum::Text(t) => 4 + t.len(),
            _ => attr.len as usize,
        };
    }
    item
}

/// Decode the full key of an index item.
pub fn item_key(desc: &TupleDesc, item: &[u8]) -> IndexKey {
    let natts = item_natts(item);
    debug_assert_eq!(natts, desc.natts());
    let has_nulls = item_has_nulls(item);
    let bits = &item[INDEX_TUPLE_HEADER..];
    let start = item_data_start(item);
    let data = &item[start..];

    let mut key = Vec::with_capacity(natts);
    let mut off = 0usize;
    for (i, attr) in desc.attrs.iter().enumerate() {
        if has_nulls && bits[i >> 3] & (1 << (i & 7)) == 0 {
            key.push(None);
            continue;
        }
        off = att_align(off, attr.align);
        let datum = match attr.kind {
            crate::common::AttrKind::Char => Datum::Char(data[off]),
            crate::common::AttrKind::Int2 => {
                Datum::Int2(i16::from_le_bytes(data[off..off + 2].try_into().unwrap()))
            }
            crate::common::AttrKind::Int4 => {
                Datum::Int4(i32::from_le_bytes(data[off..off + 4].try_into().unwrap()))
            }
            crate::common::AttrKind::Int8 => {
                Datum::Int8(i64::from_le_bytes(data[off..off + 8].try_into().unwrap()))
            }
            crate::common::AttrKind::Float8 => {
                Datum::Float8(f64::from_le_bytes(data[off..off + 8].try_into().unwrap()))
            }
            crate::common::AttrKind::Text => {
                let total = u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize;
                Datum::Text(data[off + 4..off + total].to_vec())
            }
        };
        off += match &datum {
            Datum::Text(t) => 4 + t.len(),
            _ => attr.len as usize,
        };
        key.push(Some(datum));
    }
    key
}

/// Key comparison with the null placement rule.
pub fn cmp_keys(a: &IndexKey, b: &IndexKey) -> Ordering {
    for (ka, kb) in a.iter().zip(b.iter()) {
        let ord = match (ka, kb) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(da), Some(db)) => da.compare(db),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AttrDesc;

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![AttrDesc::int4("k"), AttrDesc::text("s")])
    }

    #[test]
    fn form_and_decode() {
        let d = desc();
        let key: IndexKey = vec![Some(Datum::Int4(10)), Some(Datum::text("abc"))];
        let tid = ItemPointer::new(3, 4);
        let item = index_form_item(&d, &key, tid);
        assert_eq!(item_get_tid(&item), tid);
        assert_eq!(item_key(&d, &item), key);
    }

    #[test]
    fn null_key_round_trip() {
        let d = desc();
        let key: IndexKey = vec![Some(Datum::Int4(1)), None];
        let item = index_form_item(&d, &key, ItemPointer::new(0, 1));
        assert_eq!(item_key(&d, &item), key);
    }

    #[test]
    fn nulls_sort_greater() {
        let a: IndexKey = vec![Some(Datum::Int4(5))];
        let b: IndexKey = vec![None];
        assert_eq!(cmp_keys(&a, &b), Ordering::Less);
        assert_eq!(cmp_keys(&b, &b), Ordering::Equal);
    }

    #[test]
    fn key_ordering_is_attribute_major() {
        let a: IndexKey = vec![Some(Datum::Int4(1)), Some(Datum::text("z"))];
        let b: IndexKey = vec![Some(Datum::Int4(2)), Some(Datum::text("a"))];
        assert_eq!(cmp_keys(&a, &b), Ordering::Less);
    }
}
