// Catalog plumbing.
//
// The system catalogs are ordinary heap relations with a fixed, finite
// set of B-tree indexes. The index set is described by a static table;
// the insert and lookup adapters iterate that table instead of being
// hand-written per index.

use std::sync::Arc;

use crate::common::{AttrDesc, Datum, ItemPointer, Oid, ScanKey, SkOp, TupleDesc};
use crate::db::Database;
use crate::env::Env;
use crate::error::{DbError, Result};
use crate::index::btree::build::build_index_key;
use crate::index::btree::insert::bt_doinsert;
use crate::index::btree::scan::{btbeginscan, btendscan, btgettuple};
use crate::relation::Relation;

// System relation oids. Everything below FIRST_USER_OID is reserved.
pub const XACT_LOG_RELID: Oid = 1;
pub const VARIABLE_RELID: Oid = 2;
pub const CLASS_RELID: Oid = 3;
pub const ATTRIBUTE_RELID: Oid = 4;
pub const CLASS_ID_INDEX: Oid = 5;
pub const CLASS_NAME_INDEX: Oid = 6;
pub const ATTRIBUTE_RELID_INDEX: Oid = 7;
pub const INDEX_RELID: Oid = 8;
pub const FIRST_USER_OID: Oid = 100;

pub const XACT_LOG_NAME: &str = "xact_log";
pub const VARIABLE_NAME: &str = "variable";
pub const CLASS_NAME: &str = "sys_class";
pub const ATTRIBUTE_NAME: &str = "sys_attribute";
pub const INDEX_CATALOG_NAME: &str = "sys_index";

/// sys_class: one row per relation.
pub fn class_desc() -> TupleDesc {
    TupleDesc::new(vec![
        AttrDesc::int4("relid"),
        AttrDesc::text("relname"),
        AttrDesc::char("relkind"),
        AttrDesc::int2("relnatts"),
    ])
}

/// sys_attribute: one row per attribute.
pub fn attribute_desc() -> TupleDesc {
    TupleDesc::new(vec![
        AttrDesc::int4("attrelid"),
        AttrDesc::text("attname"),
        AttrDesc::int2("attnum"),
        AttrDesc::int4("attlen"),
        AttrDesc::char("attalign"),
        AttrDesc::char("attkind"),
        AttrDesc::char("attbyval"),
    ])
}

/// sys_index: one row per index, carrying what the class row cannot.
pub fn index_catalog_desc() -> TupleDesc {
    TupleDesc::new(vec![
        AttrDesc::int4("indexrelid"),
        AttrDesc::int4("indrelid"),
        AttrDesc::text("indkey"),
        AttrDesc::char("indisunique"),
    ])
}

/// Encode key attribute numbers for the sys_index indkey column.
pub fn encode_keyattrs(keyattrs: &[u16]) -> String {
    keyattrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_keyattrs(s: &str) -> Vec<u16> {
    s.split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect()
}

/// One catalog index: which heap, which key attributes.
pub struct CatalogIndexDesc {
    pub id: Oid,
    pub name: &'static str,
    pub heap: Oid,
    pub keyattrs: &'static [u16],
    pub unique: bool,
}

/// The fixed set of catalog indexes. Adapters below are generated by
/// iterating this table.
pub const CATALOG_INDEXES: &[CatalogIndexDesc] = &[
    CatalogIndexDesc {
        id: CLASS_ID_INDEX,
        name: "sys_class_id_index",
        heap: CLASS_RELID,
        keyattrs: &[1],
        unique: true,
    },
    CatalogIndexDesc {
        id: CLASS_NAME_INDEX,
        name: "sys_class_name_index",
        heap: CLASS_RELID,
        keyattrs: &[2],
        unique: true,
    },
    CatalogIndexDesc {
        id: ATTRIBUTE_RELID_INDEX,
        name: "sys_attribute_relid_index",
        heap: ATTRIBUTE_RELID,
        keyattrs: &[1, 3],
        unique: true,
    },
];

/// Tuple descriptor of an index over `heap_desc` keyed by `keyattrs`.
pub fn index_tuple_desc(heap_desc: &TupleDesc, keyattrs: &[u16]) -> TupleDesc {
    TupleDesc::new(
        keyattrs
            .iter()
            .map(|&a| heap_desc.attrs[(a - 1) as usize].clone())
            .collect(),
    )
}

/// Maintain every catalog index of `heap` for a newly inserted row.
pub fn catalog_index_insert(
    db: &Database,
    env: &mut Env,
    heap: &Arc<Relation>,
    tup: &[u8],
    tid: ItemPointer,
) -> Result<()> {
    for desc in CATALOG_INDEXES.iter().filter(|d| d.heap == heap.id) {
        let index = db
            .relcache()
            .get(heap.db, desc.id)
            .ok_or_else(|| DbError::Catalog(format!("missing catalog index {}", desc.name)))?;
        let key = build_index_key(heap, desc.keyattrs, tup);
        bt_doinsert(db, env, &index, Some(heap.as_ref()), &key, tid, desc.unique)?;
    }
    Ok(())
}

/// Equality lookup through one catalog index; returns matching heap
/// TIDs in index order.
pub fn catalog_index_lookup(
    db: &Database,
    env: &mut Env,
    index_id: Oid,
    keys: &[Datum],
) -> Result<Vec<ItemPointer>> {
    let desc = CATALOG_INDEXES
        .iter()
        .find(|d| d.id == index_id)
        .ok_or_else(|| DbError::Catalog(format!("unknown catalog index {}", index_id)))?;
    let index = db
        .relcache()
        .get(crate::common::DEFAULT_DB_OID, desc.id)
        .ok_or_else(|| DbError::Catalog(format!("missing catalog index {}", desc.name)))?;

    let scankeys: Vec<ScanKey> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| ScanKey::new((i + 1) as u16, SkOp::Eq, k.clone()))
        .collect();

    let mut scan = btbeginscan(index.clone(), scankeys);
    let mut tids = Vec::new();
    while let Some(tid) = btgettuple(db, env, &mut scan)? {
        tids.push(tid);
    }
    btendscan(db, env, &mut scan);
    Ok(tids)
}

/// Storage-kind encoding used by the attkind column.
pub fn attr_kind_to_char(kind: crate::common::AttrKind) -> u8 {
    match kind {
        crate::common::AttrKind::Char => b'c',
        crate::common::AttrKind::Int2 => b'2',
        crate::common::AttrKind::Int4 => b'4',
        crate::common::AttrKind::Int8 => b'8',
        crate::common::AttrKind::Float8 => b'f',
        crate::common::AttrKind::Text => b't',
    }
}

pub fn attr_kind_from_char(c: u8) -> crate::common::AttrKind {
    match c {
        b'c' => crate::common::AttrKind::Char,
        b'2' => crate::common::AttrKind::Int2,
        b'8' => crate::common::AttrKind::Int8,
        b'f' => crate::common::AttrKind::Float8,
        b't' => crate::common::AttrKind::Text,
        _ => crate::common::AttrKind::Int4,
    }
}

/// Datum helpers for oid-valued catalog columns.
#[inline]
pub fn oid_datum(oid: Oid) -> Datum {
    Datum::Int4(oid as i32)
}

#[inline]
pub fn datum_oid(d: &Datum) -> Option<Oid> {
    match d {
        Datum::Int4(v) => Some(*v as Oid),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_index_table_is_consistent() {
        for desc in CATALOG_INDEXES {
            assert!(desc.id < FIRST_USER_OID);
            assert!(!desc.keyattrs.is_empty());
            let heap_desc = if desc.heap == CLASS_RELID {
                class_desc()
            } else {
                attribute_desc()
            };
            for &a in desc.keyattrs {
                assert!((a as usize) <= heap_desc.natts());
            }
        }
    }

    #[test]
    fn index_tuple_desc_projects_key_attrs() {
        let d = index_tuple_desc(&attribute_desc(), &[1, 3]);
        assert_eq!(d.natts(), 2);
        assert_eq!(d.attrs[0].name, "attrelid");
        assert_eq!(d.attrs[1].name, "attnum");
    }
}
