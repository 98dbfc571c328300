//! Point-in-time captures of an object and its structural dependents
//!
//! A snapshot is an owned tree: it holds field values only, never live
//! objects, so it can be kept, serialized and replayed after the objects
//! it was taken from are gone.

use crate::error::Result;
use crate::kinds::ObjectKind;
use crate::request::{self, Intent, Request, Scope};
use crate::store::StoreGuard;
use crate::types::{FieldMap, Record, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::trace;

/// One captured object plus the captures of everything depending on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub kind: ObjectKind,
    pub key: FieldMap,
    pub fields: FieldMap,
    #[serde(default)]
    pub dependents: Vec<Snapshot>,
}

impl Snapshot {
    /// Number of direct dependents
    pub fn dependent_count(&self) -> usize {
        self.dependents.len()
    }

    /// Every capture in the tree, root first, depth first
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// Requests reproducing the whole tree, root first
    pub fn requests(&self, scope: Scope, intent: Intent) -> Vec<Request> {
        self.walk()
            .map(|snp| request::build(snp.kind, &snp.key, &snp.fields, None, scope, intent))
            .collect()
    }
}

/// Pre-order iterator over a snapshot tree
pub struct Walk<'a> {
    stack: Vec<&'a Snapshot>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Snapshot;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.dependents.iter().rev());
        Some(node)
    }
}

/// Relations whose rows point at a link through a column
///
/// `(kind of the dependent, relation, referencing column)`
const LINK_DEPENDENCIES: [(ObjectKind, &str, &str); 2] = [
    // bridge and bond ports
    (ObjectKind::Interface, "interfaces", "IFLA_MASTER"),
    // vlans on top of the link
    (ObjectKind::Vlan, "vlan", "IFLA_LINK"),
];

/// Capture `fields` and, recursively, every dependent found in the store
///
/// The caller holds `guard` for the whole capture so the tree reflects a
/// single state of the store.
pub(crate) fn capture(
    guard: &mut StoreGuard<'_>,
    kind: ObjectKind,
    key: FieldMap,
    fields: FieldMap,
) -> Result<Snapshot> {
    let mut visited = HashSet::new();
    capture_node(guard, kind, key, fields, &mut visited)
}

fn capture_node(
    guard: &mut StoreGuard<'_>,
    kind: ObjectKind,
    key: FieldMap,
    fields: FieldMap,
    visited: &mut HashSet<(String, i64)>,
) -> Result<Snapshot> {
    let mut snp = Snapshot {
        kind,
        key,
        fields,
        dependents: Vec::new(),
    };
    if !kind.spec().has_dependents {
        return Ok(snp);
    }
    let (Some(Value::Text(target)), Some(index)) = (
        snp.key.get("target").cloned(),
        snp.key.get("index").and_then(Value::as_i64),
    ) else {
        return Ok(snp);
    };
    // Links in all three views are the same row
    visited.insert((target.clone(), index));

    for (dep_kind, relation, column) in LINK_DEPENDENCIES {
        let table = dep_kind.table();
        let rows = guard.query(
            &format!(
                "SELECT * FROM {} WHERE f_target = ? AND f_{} = ?",
                relation, column
            ),
            &[Value::Text(target.clone()), Value::Integer(index)],
        )?;
        for row in rows {
            let fields = row_fields(dep_kind, row);
            let Some(dep_index) = fields.get("index").and_then(Value::as_i64) else {
                continue;
            };
            if visited.contains(&(target.clone(), dep_index)) {
                continue;
            }
            let dep_key: FieldMap = table
                .key_fields()
                .map(|k| (k.to_string(), fields.get(k).cloned().unwrap_or_default()))
                .collect();
            trace!(%kind, index, dependent = dep_index, "Capturing dependent");
            let dep = capture_node(guard, dep_kind, dep_key, fields, visited)?;
            snp.dependents.push(dep);
        }
    }
    Ok(snp)
}

/// Field map of a row read with `SELECT *` from the kind's relation
pub(crate) fn row_fields(kind: ObjectKind, row: Record) -> FieldMap {
    let mut fields: FieldMap = kind
        .table()
        .names()
        .map(str::to_string)
        .zip(row)
        .collect();
    apply_derived(kind, &mut fields);
    fields
}

/// Recompute derived fields from their source columns
pub(crate) fn apply_derived(kind: ObjectKind, fields: &mut FieldMap) {
    if kind.spec().derived_state {
        let up = fields
            .get("flags")
            .and_then(Value::as_i64)
            .is_some_and(|flags| flags & 1 == 1);
        fields.insert(
            "state".to_string(),
            Value::from(if up { "up" } else { "down" }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fields;

    fn node(index: i64, dependents: Vec<Snapshot>) -> Snapshot {
        Snapshot {
            kind: ObjectKind::Interface,
            key: fields([("target", Value::from("h1")), ("index", Value::Integer(index))]),
            fields: fields([("index", Value::Integer(index))]),
            dependents,
        }
    }

    #[test]
    fn test_walk_is_preorder() {
        let tree = node(1, vec![node(2, vec![node(4, vec![])]), node(3, vec![])]);
        let order: Vec<i64> = tree
            .walk()
            .map(|s| s.key["index"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 4, 3]);
        assert_eq!(tree.dependent_count(), 2);
    }

    #[test]
    fn test_requests_follow_walk() {
        let tree = node(1, vec![node(2, vec![])]);
        let reqs = tree.requests(Scope::Store, Intent::Create);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].fields["index"], Value::Integer(2));
    }

    #[test]
    fn test_derived_state() {
        let mut up = fields([("flags", Value::Integer(0x1003))]);
        apply_derived(ObjectKind::Interface, &mut up);
        assert_eq!(up["state"], Value::from("up"));

        let mut down = fields([("flags", Value::Null)]);
        apply_derived(ObjectKind::Bridge, &mut down);
        assert_eq!(down["state"], Value::from("down"));

        let mut addr = fields([("flags", Value::Integer(1))]);
        apply_derived(ObjectKind::Address, &mut addr);
        assert!(!addr.contains_key("state"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let tree = node(1, vec![node(2, vec![])]);
        let json = serde_json::to_string(&tree).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }
}
