//! Core value types shared by the event stream, the store and live objects
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Origins identify mirrored systems

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Origin used when the caller does not name one
pub const DEFAULT_ORIGIN: &str = "localhost";

/// Identifier of one attached network namespace or host
///
/// Every row and every event is tagged with the origin it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin(String);

impl Origin {
    /// Create an origin from any name or UUID string
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGIN)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Origin {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Origin {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&Origin> for Value {
    fn from(origin: &Origin) -> Self {
        Value::Text(origin.0.clone())
    }
}

/// A single column value
///
/// Mirrors the storage classes both backends agree on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, if it has one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text view of the value, if it has one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the value as one CSV field
    ///
    /// Numbers are written bare, null as an empty field and anything else
    /// single-quoted, with embedded quotes doubled.
    pub fn to_csv(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Real(r) => r.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "'{}'", s),
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Integer(i64::from(v))
                }
            }
        )*
    };
}

value_from_int!(i64, i32, i16, i8, u32, u16, u8);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Named field values of one entity, ordered by field name
pub type FieldMap = BTreeMap<String, Value>;

/// One positional row as returned by the store
pub type Record = Vec<Value>;

/// Build a [`FieldMap`] from name/value pairs
pub fn fields<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Compact `{name: value, ...}` rendering used in log lines and errors
pub fn describe(map: &FieldMap) -> String {
    let parts: Vec<String> = map.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
    format!("{{{}}}", parts.join(", "))
}

/// Render a record as a tuple, e.g. `('h1', 2, 'eth0')`
pub fn record_to_string(record: &[Value]) -> String {
    let parts: Vec<String> = record.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}
