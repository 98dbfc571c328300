//! Per-kind facade over the store
//!
//! A [`View`] mints [`LiveObject`]s on demand and runs the bulk queries
//! (dump, summary, csv) for its kind.

use crate::error::{NdbError, Result};
use crate::event::EventKind;
use crate::kinds::ObjectKind;
use crate::object::{Key, LiveObject};
use crate::registry::{HandlerRegistry, Registration};
use crate::report::Report;
use crate::store::{Store, nla2name};
use crate::types::{FieldMap, Origin, Record, Value};
use std::sync::Arc;
use tracing::debug;

/// Entry point for one object kind
#[derive(Clone)]
pub struct View {
    kind: ObjectKind,
    store: Arc<Store>,
    registry: Arc<HandlerRegistry>,
    default_origin: Origin,
}

impl View {
    pub fn new(
        kind: ObjectKind,
        store: Arc<Store>,
        registry: Arc<HandlerRegistry>,
        default_origin: Origin,
    ) -> Self {
        Self {
            kind,
            store,
            registry,
            default_origin,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// A new live object for `key`
    ///
    /// Every call returns a distinct object. The object is registered as a
    /// weak handler, so it stays current for as long as the caller keeps
    /// it and its registration disappears once it is dropped.
    pub fn get(&self, key: impl Into<Key>) -> Result<Arc<LiveObject>> {
        let obj = LiveObject::load(
            self.kind,
            Arc::clone(&self.store),
            key.into(),
            &self.default_origin,
        )?;
        let kind = EventKind::Message(self.kind.spec().message);
        self.registry.register(
            kind,
            Registration::weak(format!("{}.on_event", self.kind), &obj, LiveObject::on_event),
        );
        // Dependent rows go away with their link without a message of
        // their own
        if !self.kind.is_link() {
            self.registry.register(
                EventKind::LINK,
                Registration::weak(format!("{}.on_link", self.kind), &obj, LiveObject::on_event),
            );
        }
        debug!(kind = %self.kind, "Registered live object");
        Ok(obj)
    }

    /// Every column of every row, header first
    ///
    /// `matches` restricts the rows to exact field values; unknown field
    /// names fail immediately with [`NdbError::FieldNotFound`].
    pub fn dump(&self, matches: &FieldMap) -> Result<Report<Record>> {
        let table = self.kind.table();
        let eq = self.store.dialect().null_safe_eq();
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        for (name, value) in matches {
            let column = table
                .resolve_field(name)
                .ok_or_else(|| NdbError::FieldNotFound(name.clone()))?;
            conditions.push(format!("rs.f_{} {} ?", column, eq));
            params.push(value.clone());
        }
        let mut sql = format!("SELECT * FROM {} AS rs", table.name);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let header: Record = table.names().map(|n| Value::Text(nla2name(n))).collect();
        Ok(deferred(Arc::clone(&self.store), header, sql, params))
    }

    /// The kind's curated projection, or its key fields when it has none
    pub fn summary(&self) -> Report<Record> {
        match &self.kind.spec().summary {
            Some(summary) => {
                let header = summary.header.iter().map(|h| Value::from(*h)).collect();
                deferred(
                    Arc::clone(&self.store),
                    header,
                    summary.sql.to_string(),
                    Vec::new(),
                )
            }
            None => {
                let table = self.kind.table();
                let header = table.key_fields().map(|k| Value::Text(nla2name(k))).collect();
                let columns: Vec<String> = table.key_fields().map(|k| format!("f_{}", k)).collect();
                let sql = format!(
                    "SELECT {cols} FROM {} ORDER BY {cols}",
                    table.name,
                    cols = columns.join(", ")
                );
                deferred(Arc::clone(&self.store), header, sql, Vec::new())
            }
        }
    }

    /// [`dump`](Self::dump) rendered as CSV lines
    pub fn csv(&self, matches: &FieldMap) -> Result<Report<String>> {
        Ok(self.dump(matches)?.csv())
    }
}

/// Header row, then the rows of `sql`; the query runs only once the
/// header has been consumed
fn deferred(store: Arc<Store>, header: Record, sql: String, params: Vec<Value>) -> Report<Record> {
    Report::new(move || {
        let store = Arc::clone(&store);
        let sql = sql.clone();
        let params = params.clone();
        let rows = std::iter::once_with(move || store.fetch(&sql, &params)).flat_map(|result| {
            match result {
                Ok(rows) => rows.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            }
        });
        Box::new(std::iter::once(Ok(header.clone())).chain(rows))
    })
}
