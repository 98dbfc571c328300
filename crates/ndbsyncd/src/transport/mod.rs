//! Transport channels feeding a source reader
//!
//! A transport is one origin's connection to its network state: it can
//! dump the current state per entity kind, block for the next event
//! batch, and be closed from another thread.
//!
//! # Disconnect contract
//!
//! `close()` must make the pending (or next) `recv()` return a batch whose
//! first event is [`RtnlMessage::disconnect`](crate::event::RtnlMessage::disconnect),
//! i.e. a message header carrying [`ECONNRESET`](crate::event::ECONNRESET).
//! A peer that hangs up is reported the same way. Any `Err` returned by
//! `recv()` is treated as a broken channel and kills the reader thread.

mod channel;
mod file;

pub use channel::{ChannelTransport, TransportHandle};
pub use file::FileTransport;

use crate::error::Result;
use crate::event::{Event, MessageKind};

/// One origin's source of network-state events
pub trait Transport: Send + Sync {
    /// Current state of every entity of `kind`
    fn dump(&self, kind: MessageKind) -> Result<Vec<Event>>;

    /// Block until the next batch of events arrives
    fn recv(&self) -> Result<Vec<Event>>;

    /// Close the channel; wakes a blocked `recv()` with a disconnect batch
    fn close(&self) -> Result<()>;
}
