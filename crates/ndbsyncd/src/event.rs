//! Event model for the mirrored network state
//!
//! Sources deliver batches of [`Event`]s. Network-state messages are
//! dispatched by [`EventKind`]; the remaining variants are control signals
//! or error conditions.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Kernel state changes as typed events
//! - AU-12: Audit Record Generation - Messages are serializable for logging

use crate::types::{FieldMap, Value};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Error code carried by a message header when the peer closed the channel
pub const ECONNRESET: i32 = 104;

/// Netlink message type used for error/ack messages
const NLMSG_ERROR: u16 = 2;

/// Entity family a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// RTM_*LINK
    Link,
    /// RTM_*ADDR
    Address,
    /// RTM_*ROUTE
    Route,
    /// RTM_*NEIGH
    Neighbour,
    /// Any other netlink message type
    Other(u16),
}

impl MessageKind {
    /// Kinds requested during a source's initial dump, in order
    pub const DUMP_ORDER: [MessageKind; 4] = [
        MessageKind::Link,
        MessageKind::Address,
        MessageKind::Neighbour,
        MessageKind::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Link => "link",
            MessageKind::Address => "address",
            MessageKind::Route => "route",
            MessageKind::Neighbour => "neighbour",
            MessageKind::Other(_) => "other",
        }
    }
}

/// What the message does to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// New entity or update (RTM_NEW*)
    #[default]
    New,
    /// Entity removed (RTM_DEL*)
    Del,
    /// Dump response (RTM_GET*)
    Get,
}

/// Header fields common to every message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sequence number of the request this answers, 0 for broadcasts
    #[serde(default)]
    pub sequence: u32,
    /// Error code reported by the peer
    #[serde(default)]
    pub error: Option<i32>,
}

/// A typed network-state message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtnlMessage {
    pub kind: MessageKind,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub header: MessageHeader,
    /// Header fields and attributes, keyed by column name
    #[serde(default)]
    pub fields: FieldMap,
}

impl RtnlMessage {
    /// Create a message with no fields
    pub fn new(kind: MessageKind, action: Action) -> Self {
        Self {
            kind,
            action,
            header: MessageHeader::default(),
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// An error message carrying `code` in its header
    pub fn error(code: i32) -> Self {
        let mut msg = Self::new(MessageKind::Other(NLMSG_ERROR), Action::New);
        msg.header.error = Some(code);
        msg
    }

    /// The "connection closed by peer" message that ends a source
    pub fn disconnect() -> Self {
        Self::error(ECONNRESET)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// True if the header reports a peer disconnect
    pub fn is_disconnect(&self) -> bool {
        self.header.error == Some(ECONNRESET)
    }
}

/// An error condition delivered through the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// One-shot notification that can be passed through the event stream
///
/// Clones share the same flag, so the signal can be handed to a source
/// and waited on by the caller.
#[derive(Clone, Default)]
pub struct ReadySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter
    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub fn clear(&self) {
        *self.inner.0.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the flag is set
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock();
        while !*ready {
            cvar.wait(&mut ready);
        }
    }

    /// Block until the flag is set or `timeout` elapses; returns the flag
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock();
        if !*ready {
            cvar.wait_while_for(&mut ready, |ready| !*ready, timeout);
        }
        *ready
    }

    /// True if both handles share one flag
    pub fn same_as(&self, other: &ReadySignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadySignal")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Handler lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message(MessageKind),
    Ready,
    Shutdown,
    Error,
}

impl EventKind {
    pub const LINK: EventKind = EventKind::Message(MessageKind::Link);
    pub const ADDRESS: EventKind = EventKind::Message(MessageKind::Address);
    pub const ROUTE: EventKind = EventKind::Message(MessageKind::Route);
    pub const NEIGHBOUR: EventKind = EventKind::Message(MessageKind::Neighbour);
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Message(MessageKind::Other(t)) => write!(f, "message(type {})", t),
            EventKind::Message(kind) => write!(f, "message({})", kind.as_str()),
            EventKind::Ready => f.write_str("ready"),
            EventKind::Shutdown => f.write_str("shutdown"),
            EventKind::Error => f.write_str("error"),
        }
    }
}

/// A single entry of an event batch
#[derive(Debug, Clone)]
pub enum Event {
    /// Network-state message
    Message(RtnlMessage),
    /// Set the signal once everything queued before it has been applied
    Ready(ReadySignal),
    /// Stop the dispatch loop
    Shutdown,
    /// Error condition; fatal if nobody handles it
    Error(EventError),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Message(msg) => EventKind::Message(msg.kind),
            Event::Ready(_) => EventKind::Ready,
            Event::Shutdown => EventKind::Shutdown,
            Event::Error(_) => EventKind::Error,
        }
    }

    pub fn as_message(&self) -> Option<&RtnlMessage> {
        match self {
            Event::Message(msg) => Some(msg),
            _ => None,
        }
    }
}

impl From<RtnlMessage> for Event {
    fn from(msg: RtnlMessage) -> Self {
        Event::Message(msg)
    }
}

/// True if the batch signals that the peer closed the channel
///
/// Only the first event is inspected; a disconnect is always delivered as
/// a batch of its own.
pub fn is_disconnect(batch: &[Event]) -> bool {
    matches!(batch.first(), Some(Event::Message(msg)) if msg.is_disconnect())
}
