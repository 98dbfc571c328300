//! Per-origin source reader
//!
//! A [`Source`] owns one origin's transport. Starting it enqueues the
//! origin's full state, then a dedicated thread relays every further batch
//! into the shared [`EventQueue`] until the transport reports a disconnect.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Continuous relay of kernel state changes
//! - SC-7: Boundary Protection - Each origin has its own isolated channel

use crate::error::{NdbError, Result};
use crate::event::{Event, MessageKind, ReadySignal, is_disconnect};
use crate::queue::EventQueue;
use crate::transport::Transport;
use crate::types::Origin;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument};

/// Event source bound to one origin
pub struct Source {
    origin: Origin,
    transport: Arc<dyn Transport>,
    queue: EventQueue,
    ready: Option<ReadySignal>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Source {
    /// Create a source; nothing is read until [`start`](Self::start)
    ///
    /// If `ready` is given it is enqueued once the initial state is, so the
    /// caller learns when the origin's state has been applied.
    pub fn new(
        origin: Origin,
        transport: Arc<dyn Transport>,
        queue: EventQueue,
        ready: Option<ReadySignal>,
    ) -> Self {
        Self {
            origin,
            transport,
            queue,
            ready,
            thread: None,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// True while the reader thread is alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|th| !th.is_finished())
    }

    /// Enqueue the initial dump and spawn the reader thread
    #[instrument(skip(self), fields(origin = %self.origin))]
    pub fn start(&mut self) -> Result<()> {
        for kind in MessageKind::DUMP_ORDER {
            let batch = self
                .transport
                .dump(kind)
                .map_err(|e| NdbError::transport(&self.origin, e.to_string()))?;
            debug!(kind = kind.as_str(), count = batch.len(), "Initial dump");
            if !batch.is_empty() {
                self.queue.put(&self.origin, batch)?;
            }
        }
        if let Some(ready) = &self.ready {
            self.queue
                .put(&self.origin, vec![Event::Ready(ready.clone())])?;
        }

        let origin = self.origin.clone();
        let transport = Arc::clone(&self.transport);
        let queue = self.queue.clone();
        let th = thread::Builder::new()
            .name(format!("ndb-source-{}", self.origin))
            .spawn(move || relay(origin, transport, queue))?;
        self.thread = Some(th);
        info!("Source started");
        Ok(())
    }

    /// Close the transport and wait for the reader thread
    ///
    /// Returns the reader's own result, so a transport failure that killed
    /// the thread earlier is reported here.
    #[instrument(skip(self), fields(origin = %self.origin))]
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        let Some(th) = self.thread.take() else {
            return Ok(());
        };
        let result = th
            .join()
            .map_err(|_| NdbError::SourcePanicked(self.origin.clone()))?;
        info!("Source closed");
        result
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.close() {
                error!(origin = %self.origin, error = %e, "Source failed while closing");
            }
        }
    }
}

/// Reader thread body
fn relay(origin: Origin, transport: Arc<dyn Transport>, queue: EventQueue) -> Result<()> {
    loop {
        let batch = match transport.recv() {
            Ok(batch) => batch,
            Err(e) => {
                let err = NdbError::transport(&origin, e.to_string());
                error!(%origin, error = %err, "Source channel failed");
                return Err(err);
            }
        };
        if is_disconnect(&batch) {
            debug!(%origin, "Source disconnected");
            return Ok(());
        }
        match queue.put(&origin, batch) {
            Ok(()) => {}
            Err(NdbError::QueueClosed) => {
                debug!(%origin, "Dispatch loop gone, source stopping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
