//! Transport that serves a captured state file

use super::Transport;
use crate::error::Result;
use crate::event::{Event, MessageKind, RtnlMessage};
use crossbeam_channel::{Receiver, Sender};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Serves a JSON array of [`RtnlMessage`]s as an origin's state
///
/// The file is the initial dump; no further events arrive, so `recv()`
/// blocks until the transport is closed.
pub struct FileTransport {
    messages: Vec<RtnlMessage>,
    close_tx: Sender<()>,
    close_rx: Receiver<()>,
}

impl FileTransport {
    /// Load messages from a JSON file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let messages: Vec<RtnlMessage> = serde_json::from_str(&content)?;
        debug!(path = %path.display(), count = messages.len(), "Loaded state file");
        Ok(Self::from_messages(messages))
    }

    pub fn from_messages(messages: Vec<RtnlMessage>) -> Self {
        let (close_tx, close_rx) = crossbeam_channel::bounded(1);
        Self {
            messages,
            close_tx,
            close_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Transport for FileTransport {
    fn dump(&self, kind: MessageKind) -> Result<Vec<Event>> {
        Ok(self
            .messages
            .iter()
            .filter(|msg| msg.kind == kind)
            .cloned()
            .map(Event::Message)
            .collect())
    }

    fn recv(&self) -> Result<Vec<Event>> {
        // Returns on close() or when the transport is dropped
        let _ = self.close_rx.recv();
        Ok(vec![RtnlMessage::disconnect().into()])
    }

    fn close(&self) -> Result<()> {
        let _ = self.close_tx.try_send(());
        Ok(())
    }
}
