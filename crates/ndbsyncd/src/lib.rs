//! Network State Database for SONiC
//!
//! This crate mirrors kernel network state (links, addresses, routes and
//! neighbours) from any number of origins into one relational store, and
//! exposes it through self-updating live objects and bulk query views.
//!
//! # Features
//!
//! - **default**: embedded sqlite store (file or in-memory)
//! - **postgres**: client/server PostgreSQL store
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! This module implements the following security controls:
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AU-3 | Content of Audit Records | Structured logging with origin and event kind |
//! | AU-12 | Audit Record Generation | Optional `rtnl_log` mirror of inbound messages |
//! | CM-6 | Configuration Settings | TOML configuration with validation |
//! | CM-8 | System Component Inventory | Per-origin inventory of network entities |
//! | SC-7 | Boundary Protection | One isolated reader thread per origin |
//! | SI-4 | System Monitoring | Continuous, ordered application of state changes |
//! | SI-10 | Input Validation | Messages lacking key fields are rejected |
//! | SI-11 | Error Handling | Structured error types, handler failures logged |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ Source (h1)  │──┐
//! └──────────────┘  │   ┌────────────┐   ┌──────────────┐   ┌─────────┐
//! ┌──────────────┐  ├──▶│ EventQueue │──▶│ DispatchLoop │──▶│  Store  │
//! │ Source (h2)  │──┘   └────────────┘   │  (ndb-main)  │   │ sqlite/ │
//! └──────────────┘                       └──────┬───────┘   │ postgres│
//!                                               │           └────▲────┘
//!                                               ▼                │
//!                                        ┌──────────────┐   ┌────┴────┐
//!                                        │ LiveObjects  │◀──│  View   │
//!                                        │ (weak refs)  │   └─────────┘
//!                                        └──────────────┘
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod kinds;
pub mod ndb;
pub mod object;
pub mod queue;
pub mod registry;
pub mod report;
pub mod request;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod transport;
pub mod types;
pub mod view;

pub use config::{DbConfig, NdbConfig};
pub use dispatch::{DispatchLoop, LoopExit};
pub use error::{HandlerError, HandlerResult, NdbError, Result};
pub use event::{Action, Event, EventKind, MessageKind, ReadySignal, RtnlMessage};
pub use kinds::ObjectKind;
pub use ndb::Ndb;
pub use object::{Key, LiveObject};
pub use queue::EventQueue;
pub use registry::{HandlerRegistry, Registration};
pub use report::{MAX_REPORT_LINES, Report};
pub use request::{Intent, Request, Scope};
pub use snapshot::Snapshot;
pub use source::Source;
pub use store::Store;
pub use transport::{ChannelTransport, FileTransport, Transport, TransportHandle};
pub use types::{FieldMap, Origin, Record, Value, fields};
