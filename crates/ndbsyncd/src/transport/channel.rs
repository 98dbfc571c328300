//! In-memory transport driven through a [`TransportHandle`]

use super::Transport;
use crate::error::{NdbError, Result};
use crate::event::{Event, MessageKind, RtnlMessage};
use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

enum Delivery {
    Batch(Vec<Event>),
    Fail(String),
}

/// Transport whose state and event stream are supplied by the caller
///
/// Useful for tests, for replaying captured state, and for feeding events
/// produced by another component.
pub struct ChannelTransport {
    state: Mutex<Vec<RtnlMessage>>,
    rx: Receiver<Delivery>,
    close_tx: Sender<()>,
    close_rx: Receiver<()>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport whose initial dump is `state`
    pub fn new(state: Vec<RtnlMessage>) -> (Self, TransportHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded(1);
        let transport = Self {
            state: Mutex::new(state),
            rx,
            close_tx,
            close_rx,
            closed: AtomicBool::new(false),
        };
        (transport, TransportHandle { tx })
    }

    /// Transport with an empty initial state
    pub fn empty() -> (Self, TransportHandle) {
        Self::new(Vec::new())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for ChannelTransport {
    fn dump(&self, kind: MessageKind) -> Result<Vec<Event>> {
        Ok(self
            .state
            .lock()
            .iter()
            .filter(|msg| msg.kind == kind)
            .cloned()
            .map(Event::Message)
            .collect())
    }

    fn recv(&self) -> Result<Vec<Event>> {
        if self.is_closed() {
            return Ok(vec![RtnlMessage::disconnect().into()]);
        }
        select! {
            recv(self.rx) -> delivery => match delivery {
                Ok(Delivery::Batch(batch)) => Ok(batch),
                Ok(Delivery::Fail(message)) => Err(NdbError::Io(io::Error::other(message))),
                // Every handle dropped: the peer hung up
                Err(_) => Ok(vec![RtnlMessage::disconnect().into()]),
            },
            recv(self.close_rx) -> _ => Ok(vec![RtnlMessage::disconnect().into()]),
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Capacity 1 is enough to wake the single reader
            let _ = self.close_tx.try_send(());
        }
        Ok(())
    }
}

/// Sending side of a [`ChannelTransport`]
#[derive(Clone)]
pub struct TransportHandle {
    tx: Sender<Delivery>,
}

impl TransportHandle {
    /// Deliver a batch as if it came from the peer
    pub fn send(&self, batch: Vec<Event>) -> Result<()> {
        self.tx
            .send(Delivery::Batch(batch))
            .map_err(|_| NdbError::QueueClosed)
    }

    /// Deliver a single message as its own batch
    pub fn send_message(&self, msg: RtnlMessage) -> Result<()> {
        self.send(vec![msg.into()])
    }

    /// Make the reader's next `recv()` fail with `message`
    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.tx
            .send(Delivery::Fail(message.into()))
            .map_err(|_| NdbError::QueueClosed)
    }

    /// Hang up as the peer
    pub fn hangup(&self) -> Result<()> {
        self.send(vec![RtnlMessage::disconnect().into()])
    }
}
