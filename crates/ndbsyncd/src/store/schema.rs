//! Relational layout of the mirrored state
//!
//! One table per base entity kind plus the `bridge` and `vlan` views over
//! `interfaces`. Every column is stored with an `f_` prefix; the compiled
//! metadata below lists names without it.

use crate::event::MessageKind;

/// SQL dialect of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Equality operator that also matches `NULL` to `NULL`
    pub fn null_safe_eq(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "IS",
            Dialect::Postgres => "IS NOT DISTINCT FROM",
        }
    }

    fn integer(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres => "BIGINT",
        }
    }
}

/// Storage class of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Text,
}

/// Columns every table and view starts with
pub const COMMON_COLUMNS: [&str; 2] = ["target", "tflags"];

/// Compiled description of one table or view
#[derive(Debug)]
pub struct TableSpec {
    pub name: &'static str,
    /// Attribute prefix stripped by [`nla2name`]
    pub prefix: &'static str,
    /// Entity columns after `target` and `tflags`
    pub columns: &'static [(&'static str, SqlType)],
    /// Entity key fields; `target` is implied first
    pub key: &'static [&'static str],
    /// Key fields a message must carry to be materialized
    pub required: &'static [&'static str],
    /// For views: the base table and the `IFLA_INFO_KIND` filter
    pub base: Option<(&'static str, &'static str)>,
}

impl TableSpec {
    /// Every column name in storage order, without the `f_` prefix
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        COMMON_COLUMNS
            .iter()
            .copied()
            .chain(self.columns.iter().map(|(name, _)| *name))
    }

    /// Key fields with `target` first
    pub fn key_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once("target").chain(self.key.iter().copied())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }

    /// Map a caller-supplied field name to a column of this table
    ///
    /// Accepts the column name itself, its friendly form (`ifname` for
    /// `IFLA_IFNAME`) and the aliases `origin` and, for interface tables,
    /// `name`.
    pub fn resolve_field(&self, name: &str) -> Option<&'static str> {
        let wanted = match name {
            "origin" => "target".to_string(),
            "name" if self.prefix == "IFLA_" => "IFLA_IFNAME".to_string(),
            other => name2nla(self, other),
        };
        self.names().find(|n| *n == wanted)
    }

    pub fn is_view(&self) -> bool {
        self.base.is_some()
    }
}

use SqlType::{Integer, Text};

pub static INTERFACES: TableSpec = TableSpec {
    name: "interfaces",
    prefix: "IFLA_",
    columns: &[
        ("index", Integer),
        ("flags", Integer),
        ("IFLA_IFNAME", Text),
        ("IFLA_ADDRESS", Text),
        ("IFLA_BROADCAST", Text),
        ("IFLA_MTU", Integer),
        ("IFLA_MASTER", Integer),
        ("IFLA_LINK", Integer),
        ("IFLA_OPERSTATE", Text),
        ("IFLA_INFO_KIND", Text),
        ("IFLA_VLAN_ID", Integer),
        ("IFLA_BR_STP_STATE", Integer),
        ("IFLA_BR_VLAN_FILTERING", Integer),
    ],
    key: &["index"],
    required: &["index"],
    base: None,
};

pub static ADDRESSES: TableSpec = TableSpec {
    name: "addresses",
    prefix: "IFA_",
    columns: &[
        ("family", Integer),
        ("prefixlen", Integer),
        ("flags", Integer),
        ("scope", Integer),
        ("index", Integer),
        ("IFA_ADDRESS", Text),
        ("IFA_LOCAL", Text),
        ("IFA_LABEL", Text),
        ("IFA_BROADCAST", Text),
    ],
    key: &["family", "prefixlen", "index", "IFA_ADDRESS"],
    required: &["family", "prefixlen", "index"],
    base: None,
};

pub static ROUTES: TableSpec = TableSpec {
    name: "routes",
    prefix: "RTA_",
    columns: &[
        ("family", Integer),
        ("dst_len", Integer),
        ("table", Integer),
        ("proto", Integer),
        ("scope", Integer),
        ("type", Integer),
        ("RTA_DST", Text),
        ("RTA_GATEWAY", Text),
        ("RTA_OIF", Integer),
        ("RTA_PRIORITY", Integer),
        ("RTA_PREFSRC", Text),
    ],
    key: &["family", "dst_len", "table", "RTA_DST", "RTA_PRIORITY"],
    required: &["family", "dst_len", "table"],
    base: None,
};

pub static NEIGHBOURS: TableSpec = TableSpec {
    name: "neighbours",
    prefix: "NDA_",
    columns: &[
        ("family", Integer),
        ("ifindex", Integer),
        ("state", Integer),
        ("flags", Integer),
        ("ntype", Integer),
        ("NDA_DST", Text),
        ("NDA_LLADDR", Text),
    ],
    key: &["ifindex", "NDA_DST"],
    required: &["ifindex"],
    base: None,
};

pub static BRIDGE: TableSpec = TableSpec {
    name: "bridge",
    prefix: "IFLA_",
    columns: &[
        ("index", Integer),
        ("flags", Integer),
        ("IFLA_IFNAME", Text),
        ("IFLA_ADDRESS", Text),
        ("IFLA_MTU", Integer),
        ("IFLA_MASTER", Integer),
        ("IFLA_BR_STP_STATE", Integer),
        ("IFLA_BR_VLAN_FILTERING", Integer),
    ],
    key: &["index"],
    required: &["index"],
    base: Some(("interfaces", "bridge")),
};

pub static VLAN: TableSpec = TableSpec {
    name: "vlan",
    prefix: "IFLA_",
    columns: &[
        ("index", Integer),
        ("flags", Integer),
        ("IFLA_IFNAME", Text),
        ("IFLA_ADDRESS", Text),
        ("IFLA_MTU", Integer),
        ("IFLA_MASTER", Integer),
        ("IFLA_LINK", Integer),
        ("IFLA_VLAN_ID", Integer),
    ],
    key: &["index"],
    required: &["index"],
    base: Some(("interfaces", "vlan")),
};

/// Base tables in creation order
pub static TABLES: [&TableSpec; 4] = [&INTERFACES, &ADDRESSES, &ROUTES, &NEIGHBOURS];

/// Views over the base tables
pub static VIEWS: [&TableSpec; 2] = [&BRIDGE, &VLAN];

/// Look up a table or view by name
pub fn compiled(name: &str) -> Option<&'static TableSpec> {
    TABLES
        .iter()
        .chain(VIEWS.iter())
        .copied()
        .find(|spec| spec.name == name)
}

/// Table a message kind is materialized into
pub fn table_for(kind: MessageKind) -> Option<&'static TableSpec> {
    match kind {
        MessageKind::Link => Some(&INTERFACES),
        MessageKind::Address => Some(&ADDRESSES),
        MessageKind::Route => Some(&ROUTES),
        MessageKind::Neighbour => Some(&NEIGHBOURS),
        MessageKind::Other(_) => None,
    }
}

/// Friendly name of a column: `IFLA_IFNAME` becomes `ifname`
pub fn nla2name(name: &str) -> String {
    ["IFLA_", "IFA_", "RTA_", "NDA_"]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .map_or_else(|| name.to_string(), str::to_lowercase)
}

/// Column name for a friendly name, if the table has such a column
///
/// Names that are not friendly forms are returned unchanged.
pub fn name2nla(spec: &TableSpec, name: &str) -> String {
    let nla = format!("{}{}", spec.prefix, name.to_uppercase());
    if !spec.has_column(name) && spec.has_column(&nla) {
        nla
    } else {
        name.to_string()
    }
}

/// Name of the diagnostic message log table
pub const RTNL_LOG: &str = "rtnl_log";

/// DDL creating every table, index and view, in order
pub fn create_statements(dialect: Dialect) -> Vec<String> {
    let mut stmts = Vec::new();
    for spec in TABLES {
        let mut cols = vec![
            "f_target TEXT NOT NULL".to_string(),
            format!("f_tflags {} NOT NULL DEFAULT 0", dialect.integer()),
        ];
        cols.extend(spec.columns.iter().map(|(name, ty)| {
            let ty = match ty {
                Integer => dialect.integer(),
                Text => "TEXT",
            };
            format!("f_{} {}", name, ty)
        }));
        stmts.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            spec.name,
            cols.join(", ")
        ));
        let key: Vec<String> = spec.key_fields().map(|k| format!("f_{}", k)).collect();
        stmts.push(format!(
            "CREATE INDEX IF NOT EXISTS {name}_key ON {name} ({})",
            key.join(", "),
            name = spec.name
        ));
    }
    for spec in VIEWS {
        let Some((base, kind)) = spec.base else {
            continue;
        };
        let cols: Vec<String> = spec.names().map(|n| format!("f_{}", n)).collect();
        let create = match dialect {
            Dialect::Sqlite => "CREATE VIEW IF NOT EXISTS",
            Dialect::Postgres => "CREATE OR REPLACE VIEW",
        };
        stmts.push(format!(
            "{} {} AS SELECT {} FROM {} WHERE f_IFLA_INFO_KIND = '{}'",
            create,
            spec.name,
            cols.join(", "),
            base,
            kind
        ));
    }
    let id = match dialect {
        Dialect::Sqlite => "f_id INTEGER PRIMARY KEY AUTOINCREMENT",
        Dialect::Postgres => "f_id BIGSERIAL PRIMARY KEY",
    };
    stmts.push(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, f_target TEXT NOT NULL, f_kind TEXT, f_action TEXT, f_payload TEXT)",
        RTNL_LOG, id
    ));
    stmts
}

/// `f_target = ? AND f_x IS ? ...` over the table's key fields
pub fn key_clause(spec: &TableSpec, dialect: Dialect) -> String {
    spec.key_fields()
        .map(|k| {
            if k == "target" {
                "f_target = ?".to_string()
            } else {
                format!("f_{} {} ?", k, dialect.null_safe_eq())
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}
