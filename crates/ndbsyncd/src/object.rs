//! Live objects: self-updating proxies over one row
//!
//! A [`LiveObject`] is created by a view for a possibly partial key. The
//! key is completed against the store, the row (if any) is loaded, and the
//! view registers the object as a weak handler so that later messages for
//! the same key update it in place. Objects are never cached: two lookups
//! of one key give two independent objects observing the same row.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Typed view of each network entity
//! - CM-3: Configuration Change Control - Snapshots support rollback

use crate::error::{HandlerResult, NdbError, Result};
use crate::event::{Action, Event, MessageKind, RtnlMessage};
use crate::kinds::{NameKey, ObjectKind};
use crate::request::{self, Intent, Request, Scope};
use crate::snapshot::{self, Snapshot};
use crate::store::{Store, StoreGuard, TableSpec};
use crate::types::{FieldMap, Origin, Value, describe};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Lookup key for a live object
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// Kind-specific name: interface name, `ADDR/LEN`, route or neighbour
    /// destination
    Name(String),
    /// Kind-specific index: interface index, or the link an address,
    /// route or neighbour belongs to
    Index(i64),
    /// Explicit fields, by column or friendly name
    Fields(FieldMap),
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Name(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Name(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Index(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Index(i64::from(i))
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Key::Index(i64::from(i))
    }
}

impl From<FieldMap> for Key {
    fn from(map: FieldMap) -> Self {
        Key::Fields(map)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(s) => write!(f, "'{}'", s),
            Key::Index(i) => write!(f, "{}", i),
            Key::Fields(map) => f.write_str(&describe(map)),
        }
    }
}

#[derive(Debug, Default)]
struct ObjectState {
    fields: FieldMap,
    present: bool,
    changed: BTreeSet<String>,
}

/// Ephemeral proxy over one row
pub struct LiveObject {
    kind: ObjectKind,
    store: Arc<Store>,
    key: FieldMap,
    state: RwLock<ObjectState>,
}

impl LiveObject {
    /// Resolve `key` and load the matching row
    ///
    /// A key that names every key field always succeeds; the object simply
    /// does not [`exist`](Self::exists) yet if the store has no such row.
    /// A partial key must match exactly one row, otherwise the lookup fails
    /// with [`NdbError::NotFound`].
    pub fn load(
        kind: ObjectKind,
        store: Arc<Store>,
        key: Key,
        default_origin: &Origin,
    ) -> Result<Arc<Self>> {
        let table = kind.table();
        let shown = key.to_string();
        let partial = complete_key(kind, key, default_origin)?;

        let (key, row) = {
            let mut guard = store.lock();
            let key = resolve_key(&mut guard, table, partial, &shown)?;
            let row = fetch_row(&mut guard, table, &key)?;
            (key, row)
        };

        let mut state = ObjectState::default();
        match row {
            Some(fields) => {
                state.fields = fields;
                state.present = true;
            }
            None => state.fields = key.clone(),
        }
        if state.present {
            snapshot::apply_derived(kind, &mut state.fields);
        }
        debug!(%kind, key = %describe(&key), present = state.present, "Loaded object");

        Ok(Arc::new(Self {
            kind,
            store,
            key,
            state: RwLock::new(state),
        }))
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Complete key, `target` included
    pub fn key(&self) -> &FieldMap {
        &self.key
    }

    pub fn target(&self) -> Origin {
        match self.key.get("target") {
            Some(Value::Text(t)) => Origin::new(t.as_str()),
            _ => Origin::default(),
        }
    }

    /// True while the store has a row for the key
    pub fn exists(&self) -> bool {
        self.state.read().present
    }

    /// Current value of a field, by column or friendly name
    pub fn get(&self, name: &str) -> Option<Value> {
        let column = self.field_name(name)?;
        self.state.read().fields.get(&column).cloned()
    }

    /// Change a field locally; the change is carried by update requests
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let column = self
            .field_name(name)
            .ok_or_else(|| NdbError::FieldNotFound(name.to_string()))?;
        let mut state = self.state.write();
        state.fields.insert(column.clone(), value.into());
        state.changed.insert(column);
        Ok(())
    }

    /// Copy of every known field
    pub fn fields(&self) -> FieldMap {
        self.state.read().fields.clone()
    }

    /// Fields set locally since the last load
    pub fn changed(&self) -> BTreeSet<String> {
        self.state.read().changed.clone()
    }

    /// Re-read the row from the store, dropping local changes
    pub fn reload(&self) -> Result<()> {
        let row = {
            let mut guard = self.store.lock();
            fetch_row(&mut guard, self.kind.table(), &self.key)?
        };
        let mut state = self.state.write();
        state.changed.clear();
        match row {
            Some(mut fields) => {
                snapshot::apply_derived(self.kind, &mut fields);
                state.fields = fields;
                state.present = true;
            }
            None => state.present = false,
        }
        Ok(())
    }

    /// Handler invoked by the dispatch loop for the kind's messages
    pub fn on_event(&self, origin: &Origin, event: &Event) -> HandlerResult {
        let Some(msg) = event.as_message() else {
            return Ok(());
        };
        if msg.kind == MessageKind::Link && !self.kind.is_link() {
            self.on_link(origin, msg);
            return Ok(());
        }
        if msg.kind != self.kind.spec().message || !self.matches(origin, msg) {
            return Ok(());
        }
        self.load_message(origin, msg);
        Ok(())
    }

    /// Removing the link this object hangs off removes the object too
    fn on_link(&self, origin: &Origin, msg: &RtnlMessage) {
        let target = self.key.get("target").and_then(Value::as_str);
        if msg.action != Action::Del || target != Some(origin.as_str()) {
            return;
        }
        let Some(index) = msg.get("index") else {
            return;
        };
        let mut state = self.state.write();
        if state.present && state.fields.get(self.kind.spec().index_key) == Some(index) {
            state.present = false;
            state.changed.clear();
            trace!(kind = %self.kind, key = %describe(&self.key), "Object removed with its link");
        }
    }

    /// Apply a message already known to be about this object
    fn load_message(&self, origin: &Origin, msg: &RtnlMessage) {
        let mut state = self.state.write();
        state.changed.clear();
        match msg.action {
            Action::Del => {
                state.present = false;
                trace!(kind = %self.kind, key = %describe(&self.key), "Object removed");
            }
            Action::New | Action::Get => {
                let mut fields = FieldMap::new();
                for name in self.kind.table().names() {
                    let value = match name {
                        "target" => Value::from(origin),
                        "tflags" => Value::Integer(0),
                        _ => msg.get(name).cloned().unwrap_or_default(),
                    };
                    fields.insert(name.to_string(), value);
                }
                snapshot::apply_derived(self.kind, &mut fields);
                state.fields = fields;
                state.present = true;
                trace!(kind = %self.kind, key = %describe(&self.key), "Object updated");
            }
        }
    }

    fn matches(&self, origin: &Origin, msg: &RtnlMessage) -> bool {
        self.key.iter().all(|(name, value)| {
            if name == "target" {
                value.as_str() == Some(origin.as_str())
            } else {
                msg.get(name).unwrap_or(&Value::Null) == value
            }
        })
    }

    fn field_name(&self, name: &str) -> Option<String> {
        if name == "state" && self.kind.spec().derived_state {
            return Some(name.to_string());
        }
        self.kind.table().resolve_field(name).map(str::to_string)
    }

    /// Request reproducing this object's state
    ///
    /// `Update` carries only the locally changed fields; `Create` every
    /// known one; `Remove` only the key.
    pub fn build_request(&self, scope: Scope, intent: Intent) -> Request {
        let state = self.state.read();
        request::build(
            self.kind,
            &self.key,
            &state.fields,
            Some(&state.changed),
            scope,
            intent,
        )
    }

    /// Capture this object and, recursively, every link depending on it
    ///
    /// The store stays locked for the whole capture.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut guard = self.store.lock();
        let fields = self.fields();
        snapshot::capture(&mut guard, self.kind, self.key.clone(), fields)
    }
}

impl fmt::Debug for LiveObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveObject")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("present", &self.exists())
            .finish()
    }
}

impl fmt::Display for LiveObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, describe(&self.fields()))
    }
}

/// Turn a caller key into column/value pairs
fn complete_key(kind: ObjectKind, key: Key, default_origin: &Origin) -> Result<FieldMap> {
    let spec = kind.spec();
    let mut out = FieldMap::new();
    match key {
        Key::Fields(map) => {
            for (name, value) in map {
                let column = spec
                    .table
                    .resolve_field(&name)
                    .ok_or(NdbError::FieldNotFound(name))?;
                out.insert(column.to_string(), value);
            }
        }
        Key::Index(index) => {
            out.insert("target".to_string(), Value::from(default_origin));
            out.insert(spec.index_key.to_string(), Value::Integer(index));
        }
        Key::Name(name) => {
            out.insert("target".to_string(), Value::from(default_origin));
            match spec.name_key {
                NameKey::Whole(field) => {
                    out.insert(field.to_string(), Value::Text(name));
                }
                NameKey::Prefix(field, len_field) => match name.split_once('/') {
                    Some((addr, len)) => {
                        let len: i64 = len
                            .parse()
                            .map_err(|_| NdbError::not_found(spec.table.name, name.clone()))?;
                        out.insert(field.to_string(), Value::from(addr));
                        out.insert(len_field.to_string(), Value::Integer(len));
                    }
                    None => {
                        out.insert(field.to_string(), Value::from(name.as_str()));
                    }
                },
            }
        }
    }
    Ok(out)
}

/// Fill in missing key fields from the one row matching the given fields
fn resolve_key(
    guard: &mut StoreGuard<'_>,
    table: &TableSpec,
    given: FieldMap,
    shown: &str,
) -> Result<FieldMap> {
    let missing: Vec<&str> = table
        .key_fields()
        .filter(|k| !given.contains_key(*k))
        .collect();

    let resolved = if missing.is_empty() {
        given
    } else {
        let eq = guard.dialect().null_safe_eq();
        let (conditions, params): (Vec<String>, Vec<Value>) = given
            .iter()
            .map(|(name, value)| (format!("f_{} {} ?", name, eq), value.clone()))
            .unzip();
        let clause = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let columns: Vec<String> = missing.iter().map(|k| format!("f_{}", k)).collect();
        let rows = guard.query(
            &format!(
                "SELECT {} FROM {} WHERE {} LIMIT 2",
                columns.join(", "),
                table.name,
                clause
            ),
            &params,
        )?;
        let [row] = rows.as_slice() else {
            debug!(table = table.name, key = shown, matches = rows.len(), "Key did not resolve");
            return Err(NdbError::not_found(table.name, shown));
        };
        let mut key = given;
        for (name, value) in missing.iter().zip(row) {
            key.insert((*name).to_string(), value.clone());
        }
        key
    };

    // Only key fields identify the object from here on
    Ok(table
        .key_fields()
        .map(|k| (k.to_string(), resolved.get(k).cloned().unwrap_or_default()))
        .collect())
}

fn fetch_row(
    guard: &mut StoreGuard<'_>,
    table: &TableSpec,
    key: &FieldMap,
) -> Result<Option<FieldMap>> {
    let clause = crate::store::schema::key_clause(table, guard.dialect());
    let params: Vec<Value> = table
        .key_fields()
        .map(|k| key.get(k).cloned().unwrap_or_default())
        .collect();
    let rows = guard.query(
        &format!("SELECT * FROM {} WHERE {} LIMIT 1", table.name, clause),
        &params,
    )?;
    Ok(rows.into_iter().next().map(|row| {
        table
            .names()
            .map(str::to_string)
            .zip(row)
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageKind;
    use crate::types::fields;
    use pretty_assertions::assert_eq;

    fn store_with_links() -> Arc<Store> {
        let store = Arc::new(Store::memory().unwrap());
        let origin = Origin::default();
        for (index, name, flags) in [(1, "lo", 9), (2, "eth0", 0x1003), (3, "eth1", 0x1002)] {
            store
                .load_message(
                    &origin,
                    &RtnlMessage::new(MessageKind::Link, Action::New)
                        .with("index", index)
                        .with("flags", flags)
                        .with("IFLA_IFNAME", name),
                )
                .unwrap();
        }
        store
    }

    fn link_event(index: i64, flags: i64, name: &str) -> Event {
        RtnlMessage::new(MessageKind::Link, Action::New)
            .with("index", index)
            .with("flags", flags)
            .with("IFLA_IFNAME", name)
            .into()
    }

    #[test]
    fn test_name_key_resolves_index() {
        let store = store_with_links();
        let obj = LiveObject::load(ObjectKind::Interface, store, "eth0".into(), &Origin::default())
            .unwrap();
        assert!(obj.exists());
        assert_eq!(
            obj.key(),
            &fields([("target", Value::from("localhost")), ("index", Value::Integer(2))])
        );
        assert_eq!(obj.get("state"), Some(Value::from("up")));
        assert_eq!(obj.get("ifname"), Some(Value::from("eth0")));
    }

    #[test]
    fn test_unknown_name_is_not_found() {
        let store = store_with_links();
        let err = LiveObject::load(
            ObjectKind::Interface,
            store,
            Key::Fields(fields([("name", "eth9")])),
            &Origin::default(),
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_ambiguous_key_is_not_found() {
        let store = store_with_links();
        let err = LiveObject::load(
            ObjectKind::Interface,
            store,
            Key::Fields(fields([("mtu", Value::Null)])),
            &Origin::default(),
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_key_field_is_rejected() {
        let store = store_with_links();
        let err = LiveObject::load(
            ObjectKind::Interface,
            store,
            Key::Fields(fields([("colour", "blue")])),
            &Origin::default(),
        )
        .unwrap_err();
        assert!(matches!(err, NdbError::FieldNotFound(ref f) if f == "colour"));
    }

    #[test]
    fn test_complete_key_without_row() {
        let store = store_with_links();
        let obj = LiveObject::load(ObjectKind::Interface, store, 42.into(), &Origin::default())
            .unwrap();
        assert!(!obj.exists());
        assert_eq!(obj.get("index"), Some(Value::Integer(42)));

        obj.on_event(&Origin::default(), &link_event(42, 1, "dummy0"))
            .unwrap();
        assert!(obj.exists());
        assert_eq!(obj.get("name"), Some(Value::from("dummy0")));
    }

    #[test]
    fn test_row_and_event_derive_the_same_state() {
        let store = store_with_links();
        let from_row =
            LiveObject::load(ObjectKind::Interface, Arc::clone(&store), 3.into(), &Origin::default())
                .unwrap();
        let from_event =
            LiveObject::load(ObjectKind::Interface, store, 7.into(), &Origin::default()).unwrap();
        from_event
            .on_event(&Origin::default(), &link_event(7, 0x1002, "eth1"))
            .unwrap();
        assert_eq!(from_row.get("state"), Some(Value::from("down")));
        assert_eq!(from_row.get("state"), from_event.get("state"));
    }

    #[test]
    fn test_events_for_other_keys_are_ignored() {
        let store = store_with_links();
        let obj = LiveObject::load(ObjectKind::Interface, store, 2.into(), &Origin::default())
            .unwrap();
        obj.on_event(&Origin::from("h2"), &link_event(2, 0, "other"))
            .unwrap();
        obj.on_event(&Origin::default(), &link_event(3, 0, "other"))
            .unwrap();
        assert_eq!(obj.get("ifname"), Some(Value::from("eth0")));

        let mut del = RtnlMessage::new(MessageKind::Link, Action::Del).with("index", 2);
        del.header.sequence = 1;
        obj.on_event(&Origin::default(), &del.into()).unwrap();
        assert!(!obj.exists());
    }

    #[test]
    fn test_set_tracks_changes_for_update() {
        let store = store_with_links();
        let obj = LiveObject::load(ObjectKind::Interface, store, "eth1".into(), &Origin::default())
            .unwrap();
        obj.set("mtu", 9000).unwrap();
        assert!(obj.set("colour", "blue").is_err());
        let req = obj.build_request(Scope::System, Intent::Update);
        assert_eq!(req.fields["mtu"], Value::Integer(9000));
        assert_eq!(req.fields["index"], Value::Integer(3));
        assert!(req.fields.contains_key("master"));
        assert!(!req.fields.contains_key("ifname"));

        obj.reload().unwrap();
        assert!(obj.changed().is_empty());
        assert_eq!(obj.get("mtu"), Some(Value::Null));
    }

    #[test]
    fn test_address_string_key() {
        let store = Arc::new(Store::memory().unwrap());
        store
            .load_message(
                &Origin::default(),
                &RtnlMessage::new(MessageKind::Address, Action::New)
                    .with("family", 2)
                    .with("prefixlen", 24)
                    .with("index", 2)
                    .with("IFA_ADDRESS", "10.0.0.1"),
            )
            .unwrap();
        let obj = LiveObject::load(
            ObjectKind::Address,
            Arc::clone(&store),
            "10.0.0.1/24".into(),
            &Origin::default(),
        )
        .unwrap();
        assert!(obj.exists());
        assert_eq!(obj.get("index"), Some(Value::Integer(2)));
        assert!(
            LiveObject::load(ObjectKind::Address, store, "10.0.0.1/x".into(), &Origin::default())
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_route_follows_its_link_removal() {
        let store = store_with_links();
        store
            .load_message(
                &Origin::default(),
                &RtnlMessage::new(MessageKind::Route, Action::New)
                    .with("family", 2)
                    .with("dst_len", 16)
                    .with("table", 254)
                    .with("RTA_DST", "10.1.0.0")
                    .with("RTA_OIF", 2),
            )
            .unwrap();
        let route = LiveObject::load(
            ObjectKind::Route,
            Arc::clone(&store),
            "10.1.0.0/16".into(),
            &Origin::default(),
        )
        .unwrap();
        assert!(route.exists());

        let del = |index: i64| -> Event {
            RtnlMessage::new(MessageKind::Link, Action::Del)
                .with("index", index)
                .into()
        };
        route.on_event(&Origin::from("h2"), &del(2)).unwrap();
        route.on_event(&Origin::default(), &del(3)).unwrap();
        route
            .on_event(&Origin::default(), &link_event(2, 0, "eth0"))
            .unwrap();
        assert!(route.exists());

        route.on_event(&Origin::default(), &del(2)).unwrap();
        assert!(!route.exists());
    }
}
