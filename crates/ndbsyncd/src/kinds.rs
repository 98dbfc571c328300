//! Per-kind metadata for live objects and views
//!
//! Every object kind is described by one static [`KindSpec`]; the shared
//! object, snapshot and view code is parameterized by it instead of being
//! specialized per kind. `Bridge` and `Vlan` read the same `interfaces`
//! table as `Interface` through their own views.

use crate::event::MessageKind;
use crate::store::schema::{self, TableSpec};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Live object kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Interface,
    Bridge,
    Vlan,
    Address,
    Route,
    Neighbour,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::Interface,
        ObjectKind::Bridge,
        ObjectKind::Vlan,
        ObjectKind::Address,
        ObjectKind::Route,
        ObjectKind::Neighbour,
    ];

    pub fn spec(&self) -> &'static KindSpec {
        match self {
            ObjectKind::Interface => &INTERFACE,
            ObjectKind::Bridge => &BRIDGE,
            ObjectKind::Vlan => &VLAN,
            ObjectKind::Address => &ADDRESS,
            ObjectKind::Route => &ROUTE,
            ObjectKind::Neighbour => &NEIGHBOUR,
        }
    }

    /// Relation this kind reads rows from
    pub fn table(&self) -> &'static TableSpec {
        self.spec().table
    }

    /// Kind of the view named `name` (`interfaces`, `vlans`, `bridge`, ...)
    pub fn from_view_name(name: &str) -> Option<Self> {
        match name {
            "interfaces" | "interface" => Some(ObjectKind::Interface),
            "bridges" | "bridge" => Some(ObjectKind::Bridge),
            "vlans" | "vlan" => Some(ObjectKind::Vlan),
            "addresses" | "address" => Some(ObjectKind::Address),
            "routes" | "route" => Some(ObjectKind::Route),
            "neighbours" | "neighbour" => Some(ObjectKind::Neighbour),
            _ => None,
        }
    }

    /// True for the kinds backed by the `interfaces` table
    pub fn is_link(&self) -> bool {
        self.spec().message == MessageKind::Link
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Interface => "interface",
            ObjectKind::Bridge => "bridge",
            ObjectKind::Vlan => "vlan",
            ObjectKind::Address => "address",
            ObjectKind::Route => "route",
            ObjectKind::Neighbour => "neighbour",
        })
    }
}

/// Curated summary projection
#[derive(Debug)]
pub struct Summary {
    pub sql: &'static str,
    pub header: &'static [&'static str],
}

/// How a string key is split into key fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKey {
    /// The whole string is the field
    Whole(&'static str),
    /// `ADDR/LEN`: the address field plus an optional length field
    Prefix(&'static str, &'static str),
}

/// Static description of one object kind
#[derive(Debug)]
pub struct KindSpec {
    pub kind: ObjectKind,
    /// Relation rows are read from
    pub table: &'static TableSpec,
    /// Messages that update objects of this kind
    pub message: MessageKind,
    pub summary: Option<Summary>,
    /// Field(s) a string key sets
    pub name_key: NameKey,
    /// Field an integer key sets
    pub index_key: &'static str,
    /// Whether `state` is derived from `flags`
    pub derived_state: bool,
    /// Whether other links structurally depend on objects of this kind
    pub has_dependents: bool,
    /// Fields sent in system-scope requests
    pub request_fields: &'static [&'static str],
    /// Fields every system-scope request carries, even unchanged ones
    pub request_extras: &'static [&'static str],
}

const LINK_REQUEST: &[&str] = &["IFLA_IFNAME", "IFLA_ADDRESS", "IFLA_MTU", "flags", "state"];

pub static INTERFACE: KindSpec = KindSpec {
    kind: ObjectKind::Interface,
    table: &schema::INTERFACES,
    message: MessageKind::Link,
    summary: Some(Summary {
        sql: "SELECT f_target, f_index, f_IFLA_IFNAME, f_IFLA_ADDRESS, \
              CASE WHEN (f_flags & 1) = 1 THEN 'up' ELSE 'down' END \
              FROM interfaces ORDER BY f_target, f_index",
        header: &["target", "index", "ifname", "lladdr", "state"],
    }),
    name_key: NameKey::Whole("IFLA_IFNAME"),
    index_key: "index",
    derived_state: true,
    has_dependents: true,
    request_fields: LINK_REQUEST,
    request_extras: &["IFLA_MASTER"],
};

pub static BRIDGE: KindSpec = KindSpec {
    kind: ObjectKind::Bridge,
    table: &schema::BRIDGE,
    message: MessageKind::Link,
    summary: Some(Summary {
        sql: "SELECT f_target, f_index, f_IFLA_IFNAME, f_IFLA_ADDRESS, \
              f_IFLA_BR_STP_STATE, f_IFLA_BR_VLAN_FILTERING \
              FROM bridge ORDER BY f_target, f_index",
        header: &["target", "index", "ifname", "lladdr", "stp", "vlan_filtering"],
    }),
    name_key: NameKey::Whole("IFLA_IFNAME"),
    index_key: "index",
    derived_state: true,
    has_dependents: true,
    request_fields: LINK_REQUEST,
    request_extras: &["IFLA_MASTER", "IFLA_BR_STP_STATE", "IFLA_BR_VLAN_FILTERING"],
};

pub static VLAN: KindSpec = KindSpec {
    kind: ObjectKind::Vlan,
    table: &schema::VLAN,
    message: MessageKind::Link,
    summary: Some(Summary {
        sql: "SELECT f_target, f_index, f_IFLA_IFNAME, f_IFLA_ADDRESS, \
              f_IFLA_LINK, f_IFLA_VLAN_ID \
              FROM vlan ORDER BY f_target, f_index",
        header: &["target", "index", "ifname", "lladdr", "master", "vlan"],
    }),
    name_key: NameKey::Whole("IFLA_IFNAME"),
    index_key: "index",
    derived_state: true,
    has_dependents: true,
    request_fields: LINK_REQUEST,
    request_extras: &["IFLA_MASTER", "IFLA_LINK", "IFLA_VLAN_ID"],
};

pub static ADDRESS: KindSpec = KindSpec {
    kind: ObjectKind::Address,
    table: &schema::ADDRESSES,
    message: MessageKind::Address,
    summary: Some(Summary {
        sql: "SELECT a.f_target, i.f_IFLA_IFNAME, a.f_IFA_ADDRESS, a.f_prefixlen \
              FROM addresses AS a LEFT JOIN interfaces AS i \
              ON i.f_target = a.f_target AND i.f_index = a.f_index \
              ORDER BY a.f_target, a.f_index, a.f_IFA_ADDRESS",
        header: &["target", "ifname", "address", "prefixlen"],
    }),
    name_key: NameKey::Prefix("IFA_ADDRESS", "prefixlen"),
    index_key: "index",
    derived_state: false,
    has_dependents: false,
    request_fields: &["IFA_LOCAL", "IFA_LABEL", "IFA_BROADCAST", "scope"],
    request_extras: &[],
};

pub static ROUTE: KindSpec = KindSpec {
    kind: ObjectKind::Route,
    table: &schema::ROUTES,
    message: MessageKind::Route,
    summary: Some(Summary {
        sql: "SELECT f_target, f_table, f_RTA_DST, f_dst_len, f_RTA_GATEWAY, f_RTA_OIF \
              FROM routes ORDER BY f_target, f_table, f_RTA_DST",
        header: &["target", "table", "dst", "dst_len", "gateway", "oif"],
    }),
    name_key: NameKey::Prefix("RTA_DST", "dst_len"),
    index_key: "RTA_OIF",
    derived_state: false,
    has_dependents: false,
    request_fields: &["RTA_GATEWAY", "RTA_OIF", "RTA_PREFSRC", "proto", "scope", "type"],
    request_extras: &[],
};

/// Neighbours have no curated summary and fall back to their key fields
pub static NEIGHBOUR: KindSpec = KindSpec {
    kind: ObjectKind::Neighbour,
    table: &schema::NEIGHBOURS,
    message: MessageKind::Neighbour,
    summary: None,
    name_key: NameKey::Whole("NDA_DST"),
    index_key: "ifindex",
    derived_state: false,
    has_dependents: false,
    request_fields: &["NDA_LLADDR", "state", "flags"],
    request_extras: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specs_are_consistent() {
        for kind in ObjectKind::ALL {
            let spec = kind.spec();
            assert_eq!(spec.kind, kind);
            assert!(spec.table.has_column(spec.index_key), "{}", kind);
            for field in spec.request_fields.iter().chain(spec.request_extras) {
                assert!(
                    *field == "state" || spec.table.has_column(field),
                    "{} lacks {}",
                    kind,
                    field
                );
            }
            if let Some(summary) = &spec.summary {
                assert!(summary.sql.contains(spec.table.name));
            }
        }
    }

    #[test]
    fn test_link_kinds_share_messages() {
        assert!(ObjectKind::Bridge.is_link());
        assert!(ObjectKind::Vlan.is_link());
        assert!(!ObjectKind::Route.is_link());
        assert_eq!(ObjectKind::Vlan.table().name, "vlan");
    }

    #[test]
    fn test_from_view_name() {
        assert_eq!(ObjectKind::from_view_name("vlans"), Some(ObjectKind::Vlan));
        assert_eq!(ObjectKind::from_view_name("bridge"), Some(ObjectKind::Bridge));
        assert_eq!(ObjectKind::from_view_name("tunnels"), None);
    }
}
