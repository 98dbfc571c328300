//! Outbound requests built from object state
//!
//! A request is what would have to be sent to reproduce (or undo) an
//! object's state, either against the live system or against the store.

use crate::kinds::ObjectKind;
use crate::store::nla2name;
use crate::types::{FieldMap, Origin, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a request is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The live network stack; fields use friendly names
    System,
    /// The store only; fields use column names
    Store,
}

/// What the request does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Create,
    Update,
    Remove,
}

/// Request payload for one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub kind: ObjectKind,
    pub scope: Scope,
    pub intent: Intent,
    pub target: Origin,
    pub fields: FieldMap,
}

/// Build the request for an object's key and fields
///
/// `changed` limits an update to the named fields; `None` sends every
/// known field.
pub(crate) fn build(
    kind: ObjectKind,
    key: &FieldMap,
    fields: &FieldMap,
    changed: Option<&BTreeSet<String>>,
    scope: Scope,
    intent: Intent,
) -> Request {
    let spec = kind.spec();
    let rename = |name: &str| match scope {
        Scope::System => nla2name(name),
        Scope::Store => name.to_string(),
    };

    let target = match key.get("target") {
        Some(Value::Text(t)) => Origin::new(t.as_str()),
        _ => Origin::default(),
    };

    let mut out = FieldMap::new();
    for (name, value) in key {
        if name != "target" {
            out.insert(rename(name.as_str()), value.clone());
        }
    }

    if intent != Intent::Remove {
        let wanted = |name: &str| match scope {
            Scope::System => spec.request_fields.iter().any(|f| *f == name),
            Scope::Store => spec.table.has_column(name) && name != "target" && name != "tflags",
        };
        for (name, value) in fields {
            let selected = match (intent, changed) {
                (Intent::Update, Some(changed)) => changed.contains(name),
                _ => !value.is_null(),
            };
            if selected && wanted(name.as_str()) {
                out.insert(rename(name.as_str()), value.clone());
            }
        }
        if scope == Scope::System {
            for extra in spec.request_extras {
                let value = fields.get(*extra).cloned().unwrap_or_default();
                out.insert(rename(*extra), value);
            }
        }
    }

    Request {
        kind,
        scope,
        intent,
        target,
        fields: out,
    }
}
