//! Relational store of the mirrored state
//!
//! The store owns a single backend connection behind one mutex. Every
//! statement, from the dispatch loop's materialization handlers or from a
//! caller thread, runs while holding it; [`Store::lock`] hands out a guard
//! for callers that need several statements to observe one state.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-4: Information in Shared Resources - Serialized store access
//! - AU-12: Audit Record Generation - Optional raw message log

pub mod schema;
mod sqlite;

#[cfg(feature = "postgres")]
mod postgres;

pub use schema::{Dialect, TableSpec, nla2name};
pub use sqlite::{MEMORY, SqliteBackend};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

use crate::config::DbConfig;
use crate::error::{NdbError, Result};
use crate::event::{Action, EventKind, MessageKind, RtnlMessage};
use crate::registry::Registration;
use crate::types::{Origin, Record, Value};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

/// SQL text with its `?` parameters
pub type Statement = (String, Vec<Value>);

/// Connection to one relational engine
pub trait Backend: Send {
    fn dialect(&self) -> Dialect;

    /// Run one statement with `?` placeholders; returns affected rows
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Run several `;`-separated statements without parameters
    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    /// Run every statement in one transaction; either all apply or none
    fn execute_atomic(&mut self, statements: &[Statement]) -> Result<()>;

    /// Run a query and collect every row
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Record>>;

    fn commit(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Open the backend selected by `config`
pub fn connect(config: &DbConfig) -> Result<Box<dyn Backend>> {
    match config {
        DbConfig::Sqlite { spec } => Ok(Box::new(SqliteBackend::open(spec)?)),
        #[cfg(feature = "postgres")]
        DbConfig::Postgres { url } => Ok(Box::new(PostgresBackend::open(url)?)),
        #[cfg(not(feature = "postgres"))]
        DbConfig::Postgres { .. } => Err(NdbError::Config(
            "postgres provider requires the `postgres` feature".to_string(),
        )),
    }
}

/// Serialized access to the backend plus the event materializers
pub struct Store {
    backend: Mutex<Option<Box<dyn Backend>>>,
    dialect: Dialect,
    rtnl_log: bool,
}

impl Store {
    /// Open the configured backend and create the schema
    pub fn open(config: &DbConfig, rtnl_log: bool) -> Result<Self> {
        Self::with_backend(connect(config)?, rtnl_log)
    }

    /// Wrap an already connected backend and create the schema
    pub fn with_backend(mut backend: Box<dyn Backend>, rtnl_log: bool) -> Result<Self> {
        let dialect = backend.dialect();
        for stmt in schema::create_statements(dialect) {
            backend.execute_batch(&stmt)?;
        }
        info!(?dialect, rtnl_log, "Store ready");
        Ok(Self {
            backend: Mutex::new(Some(backend)),
            dialect,
            rtnl_log,
        })
    }

    /// In-memory sqlite store
    pub fn memory() -> Result<Self> {
        Self::open(
            &DbConfig::Sqlite {
                spec: MEMORY.to_string(),
            },
            false,
        )
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Compiled metadata for a table or view
    pub fn compiled(&self, name: &str) -> Option<&'static TableSpec> {
        schema::compiled(name)
    }

    /// Exclusive access for a multi-statement scope
    pub fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            backend: self.backend.lock(),
            dialect: self.dialect,
        }
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.lock().execute(sql, params)
    }

    pub fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        self.lock().query(sql, params)
    }

    /// Remove every row tagged with `origin`
    #[instrument(skip(self), fields(origin = %origin))]
    pub fn flush(&self, origin: &Origin) -> Result<usize> {
        let mut guard = self.lock();
        let mut removed = 0;
        for spec in schema::TABLES {
            removed += guard.execute(
                &format!("DELETE FROM {} WHERE f_target = ?", spec.name),
                &[Value::from(origin)],
            )?;
        }
        debug!(removed, "Flushed origin");
        Ok(removed)
    }

    pub fn commit(&self) -> Result<()> {
        self.lock().backend()?.commit()
    }

    /// Commit and close the backend; later calls are no-ops
    pub fn close(&self) -> Result<()> {
        let mut slot = self.backend.lock();
        if let Some(mut backend) = slot.take() {
            backend.commit()?;
            backend.close()?;
            info!("Store closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.backend.lock().is_none()
    }

    /// Apply one message to its table
    ///
    /// `New` and `Get` replace the row with the same key, `Del` removes it.
    /// Removing a link also removes the origin's addresses, neighbours and
    /// routes on that link. All of it happens in one transaction.
    pub fn load_message(&self, origin: &Origin, msg: &RtnlMessage) -> Result<()> {
        let Some(spec) = schema::table_for(msg.kind) else {
            return Ok(());
        };
        for field in spec.required {
            if msg.get(field).is_none_or(Value::is_null) {
                return Err(NdbError::MalformedEvent(format!(
                    "{} message from {} without {}",
                    msg.kind.as_str(),
                    origin,
                    field
                )));
            }
        }

        let where_clause = schema::key_clause(spec, self.dialect);
        let key: Vec<Value> = std::iter::once(Value::from(origin))
            .chain(
                spec.key
                    .iter()
                    .map(|k| msg.get(k).cloned().unwrap_or_default()),
            )
            .collect();

        // The old row, its replacement and any cascade commit together
        let mut statements = Vec::new();
        if self.rtnl_log {
            statements.push(log_statement(origin, msg)?);
        }
        statements.push((
            format!("DELETE FROM {} WHERE {}", spec.name, where_clause),
            key.clone(),
        ));
        match msg.action {
            Action::Del => {
                if msg.kind == MessageKind::Link {
                    statements.extend(cascade_statements(origin, &key[1]));
                }
            }
            Action::New | Action::Get => {
                let columns: Vec<String> = spec.names().map(|n| format!("f_{}", n)).collect();
                let marks = vec!["?"; columns.len()].join(", ");
                let mut values = vec![Value::from(origin), Value::Integer(0)];
                values.extend(
                    spec.columns
                        .iter()
                        .map(|(name, _)| msg.get(name).cloned().unwrap_or_default()),
                );
                statements.push((
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        spec.name,
                        columns.join(", "),
                        marks
                    ),
                    values,
                ));
            }
        }

        self.lock().execute_atomic(&statements)?;
        trace!(%origin, table = spec.name, action = ?msg.action, "Row applied");
        Ok(())
    }

    /// Handlers that materialize each message kind into its table
    pub fn event_bindings(self: &Arc<Self>) -> Vec<(EventKind, Registration)> {
        schema::TABLES
            .iter()
            .filter_map(|spec| {
                let kind = match spec.name {
                    "interfaces" => MessageKind::Link,
                    "addresses" => MessageKind::Address,
                    "routes" => MessageKind::Route,
                    "neighbours" => MessageKind::Neighbour,
                    _ => return None,
                };
                let store = Arc::clone(self);
                let registration =
                    Registration::new(format!("load_{}", spec.name), move |origin, event| {
                        if let Some(msg) = event.as_message() {
                            store.load_message(origin, msg)?;
                        }
                        Ok(())
                    });
                Some((EventKind::Message(kind), registration))
            })
            .collect()
    }
}

/// Exclusive access to the store backend
pub struct StoreGuard<'a> {
    backend: MutexGuard<'a, Option<Box<dyn Backend>>>,
    dialect: Dialect,
}

impl StoreGuard<'_> {
    fn backend(&mut self) -> Result<&mut Box<dyn Backend>> {
        self.backend.as_mut().ok_or(NdbError::Closed)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        trace!(sql, "execute");
        self.backend()?.execute(sql, params)
    }

    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        trace!(sql, "query");
        self.backend()?.query(sql, params)
    }

    pub fn execute_atomic(&mut self, statements: &[Statement]) -> Result<()> {
        trace!(count = statements.len(), "execute atomic");
        self.backend()?.execute_atomic(statements)
    }
}

/// Deletes of the origin's addresses, neighbours and routes on a link
fn cascade_statements(origin: &Origin, index: &Value) -> Vec<Statement> {
    [
        ("addresses", "f_index"),
        ("neighbours", "f_ifindex"),
        ("routes", "f_RTA_OIF"),
    ]
    .into_iter()
    .map(|(table, column)| {
        (
            format!("DELETE FROM {} WHERE f_target = ? AND {} = ?", table, column),
            vec![Value::from(origin), index.clone()],
        )
    })
    .collect()
}

fn log_statement(origin: &Origin, msg: &RtnlMessage) -> Result<Statement> {
    let payload = serde_json::to_string(msg)?;
    let action = match msg.action {
        Action::New => "new",
        Action::Del => "del",
        Action::Get => "get",
    };
    Ok((
        format!(
            "INSERT INTO {} (f_target, f_kind, f_action, f_payload) VALUES (?, ?, ?, ?)",
            schema::RTNL_LOG
        ),
        vec![
            Value::from(origin),
            Value::from(msg.kind.as_str()),
            Value::from(action),
            Value::from(payload),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::event::Event;
    use pretty_assertions::assert_eq;

    fn link(index: i64, name: &str, flags: i64) -> RtnlMessage {
        RtnlMessage::new(MessageKind::Link, Action::New)
            .with("index", index)
            .with("flags", flags)
            .with("IFLA_IFNAME", name)
    }

    fn count(store: &Store, sql: &str) -> i64 {
        store.fetch(sql, &[]).unwrap()[0][0].as_i64().unwrap()
    }

    #[test]
    fn test_new_replaces_row_with_same_key() {
        let store = Store::memory().unwrap();
        let h1 = Origin::from("h1");
        store.load_message(&h1, &link(2, "eth0", 0)).unwrap();
        store.load_message(&h1, &link(2, "eth0", 1)).unwrap();
        store.load_message(&Origin::from("h2"), &link(2, "eth0", 0)).unwrap();

        let rows = store
            .fetch(
                "SELECT f_target, f_flags FROM interfaces ORDER BY f_target",
                &[],
            )
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::from("h1"), Value::Integer(1)],
                vec![Value::from("h2"), Value::Integer(0)],
            ]
        );
    }

    #[test]
    fn test_missing_key_field_is_malformed() {
        let store = Store::memory().unwrap();
        let msg = RtnlMessage::new(MessageKind::Link, Action::New).with("IFLA_IFNAME", "eth0");
        let err = store.load_message(&Origin::default(), &msg).unwrap_err();
        assert!(matches!(err, NdbError::MalformedEvent(_)));
    }

    #[test]
    fn test_link_delete_cascades() {
        let store = Store::memory().unwrap();
        let h1 = Origin::from("h1");
        store.load_message(&h1, &link(2, "eth0", 1)).unwrap();
        let addr = RtnlMessage::new(MessageKind::Address, Action::New)
            .with("family", 2)
            .with("prefixlen", 24)
            .with("index", 2)
            .with("IFA_ADDRESS", "10.0.0.1");
        store.load_message(&h1, &addr).unwrap();
        let route = RtnlMessage::new(MessageKind::Route, Action::New)
            .with("family", 2)
            .with("dst_len", 0)
            .with("table", 254)
            .with("RTA_GATEWAY", "10.0.0.254")
            .with("RTA_OIF", 2);
        store.load_message(&h1, &route).unwrap();
        assert_eq!(count(&store, "SELECT COUNT(*) FROM routes"), 1);

        let mut del = link(2, "eth0", 1);
        del.action = Action::Del;
        store.load_message(&h1, &del).unwrap();
        assert_eq!(count(&store, "SELECT COUNT(*) FROM interfaces"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM addresses"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM routes"), 0);
    }

    #[test]
    fn test_default_route_with_null_dst_is_addressable() {
        let store = Store::memory().unwrap();
        let route = RtnlMessage::new(MessageKind::Route, Action::New)
            .with("family", 2)
            .with("dst_len", 0)
            .with("table", 254);
        store.load_message(&Origin::default(), &route).unwrap();
        store.load_message(&Origin::default(), &route).unwrap();
        assert_eq!(count(&store, "SELECT COUNT(*) FROM routes"), 1);
    }

    #[test]
    fn test_flush_removes_only_that_origin() {
        let store = Store::memory().unwrap();
        store.load_message(&Origin::from("h1"), &link(1, "lo", 9)).unwrap();
        store.load_message(&Origin::from("h2"), &link(1, "lo", 9)).unwrap();
        assert_eq!(store.flush(&Origin::from("h1")).unwrap(), 1);
        let rows = store.fetch("SELECT f_target FROM interfaces", &[]).unwrap();
        assert_eq!(rows, vec![vec![Value::from("h2")]]);
    }

    #[test]
    fn test_views_filter_on_kind() {
        let store = Store::memory().unwrap();
        let h1 = Origin::from("h1");
        store
            .load_message(&h1, &link(3, "br0", 1).with("IFLA_INFO_KIND", "bridge"))
            .unwrap();
        store
            .load_message(
                &h1,
                &link(4, "eth0.100", 1)
                    .with("IFLA_INFO_KIND", "vlan")
                    .with("IFLA_LINK", 2)
                    .with("IFLA_VLAN_ID", 100),
            )
            .unwrap();
        assert_eq!(count(&store, "SELECT COUNT(*) FROM bridge"), 1);
        let vlan = store
            .fetch("SELECT f_index, f_IFLA_VLAN_ID FROM vlan", &[])
            .unwrap();
        assert_eq!(vlan, vec![vec![Value::Integer(4), Value::Integer(100)]]);
    }

    #[test]
    fn test_rtnl_log_records_messages() {
        let store = Store::with_backend(Box::new(SqliteBackend::open(MEMORY).unwrap()), true)
            .unwrap();
        store.load_message(&Origin::from("h1"), &link(1, "lo", 9)).unwrap();
        let rows = store
            .fetch("SELECT f_target, f_kind, f_action FROM rtnl_log", &[])
            .unwrap();
        assert_eq!(
            rows,
            vec![vec![Value::from("h1"), Value::from("link"), Value::from("new")]]
        );
    }

    #[test]
    fn test_binding_reports_failure_to_dispatcher() {
        let store = Arc::new(Store::memory().unwrap());
        let bindings = store.event_bindings();
        assert_eq!(bindings.len(), 4);
        let (_, load_links) = bindings
            .iter()
            .find(|(kind, _)| *kind == EventKind::LINK)
            .unwrap();
        let bad: Event = RtnlMessage::new(MessageKind::Link, Action::New).into();
        assert!(matches!(
            load_links.invoke(&Origin::default(), &bad),
            Err(HandlerError::Failed(NdbError::MalformedEvent(_)))
        ));
        load_links
            .invoke(&Origin::default(), &link(1, "lo", 9).into())
            .unwrap();
        assert_eq!(count(&store, "SELECT COUNT(*) FROM interfaces"), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Store::memory().unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.fetch("SELECT 1", &[]), Err(NdbError::Closed)));
    }
}
