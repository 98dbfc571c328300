//! The event queue between source readers and the dispatch loop
//!
//! Unbounded FIFO of `(origin, batch)` pairs. Pushing never blocks;
//! popping blocks until a batch is available. Each source pushes from a
//! single thread, so batches of one origin keep their order. Once the
//! consumer closes the queue, pushes fail and pending batches are dropped.

use crate::error::{NdbError, Result};
use crate::event::Event;
use crate::types::Origin;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A batch of events tagged with the origin that produced it
pub type Batch = (Origin, Vec<Event>);

/// Multi-producer event queue
#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<Batch>,
    rx: Receiver<Batch>,
    closed: Arc<AtomicBool>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a batch; never blocks
    ///
    /// Fails with [`NdbError::QueueClosed`] once the queue is closed.
    pub fn put(&self, origin: &Origin, events: Vec<Event>) -> Result<()> {
        if self.is_closed() {
            return Err(NdbError::QueueClosed);
        }
        self.tx
            .send((origin.clone(), events))
            .map_err(|_| NdbError::QueueClosed)
    }

    /// Remove the oldest batch, blocking until one is available
    pub fn get(&self) -> Result<Batch> {
        self.rx.recv().map_err(|_| NdbError::QueueClosed)
    }

    /// Like [`get`](Self::get) but gives up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<Batch>> {
        match self.rx.recv_timeout(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(NdbError::QueueClosed),
        }
    }

    /// Non-blocking pop
    pub fn try_get(&self) -> Result<Option<Batch>> {
        match self.rx.try_recv() {
            Ok(batch) => Ok(Some(batch)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(NdbError::QueueClosed),
        }
    }

    /// Number of batches waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Refuse further batches and drop the pending ones; returns how many
    /// were dropped
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, MessageKind, RtnlMessage};
    use std::thread;

    fn link(index: i64) -> Event {
        RtnlMessage::new(MessageKind::Link, Action::New)
            .with("index", index)
            .into()
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        let origin = Origin::from("h1");
        for i in 0..3 {
            queue.put(&origin, vec![link(i)]).unwrap();
        }
        assert_eq!(queue.len(), 3);

        for i in 0..3 {
            let (o, events) = queue.get().unwrap();
            assert_eq!(o, origin);
            let msg = events[0].as_message().unwrap();
            assert_eq!(msg.get("index").and_then(|v| v.as_i64()), Some(i));
        }
        assert!(queue.is_empty());
        assert!(queue.try_get().unwrap().is_none());
    }

    #[test]
    fn test_per_producer_order_with_many_producers() {
        let queue = EventQueue::new();
        let producers: Vec<_> = ["h1", "h2", "h3"]
            .into_iter()
            .map(|name| {
                let q = queue.clone();
                thread::spawn(move || {
                    let origin = Origin::from(name);
                    for i in 0..100 {
                        q.put(&origin, vec![link(i)]).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut last: std::collections::HashMap<Origin, i64> = Default::default();
        while let Some((origin, events)) = queue.try_get().unwrap() {
            let index = events[0].as_message().unwrap().get("index").unwrap().as_i64().unwrap();
            let prev = last.insert(origin, index);
            assert!(prev.is_none_or(|p| p + 1 == index));
        }
        assert_eq!(last.len(), 3);
    }

    #[test]
    fn test_closed_queue_refuses_batches() {
        let queue = EventQueue::new();
        let producer = queue.clone();
        let origin = Origin::from("h1");
        producer.put(&origin, vec![link(1)]).unwrap();
        producer.put(&origin, vec![link(2)]).unwrap();

        assert_eq!(queue.close(), 2);
        assert!(producer.is_closed());
        assert!(matches!(
            producer.put(&origin, vec![link(3)]),
            Err(NdbError::QueueClosed)
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_get_timeout_empty() {
        let queue = EventQueue::new();
        assert!(queue.get_timeout(Duration::from_millis(5)).unwrap().is_none());
    }
}
