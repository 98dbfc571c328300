//! The dispatch loop: the single consumer of the event queue
//!
//! Every event is handed to the handlers registered for its kind, in
//! registration order. The loop is the only writer of live-object state
//! and the only driver of store materialization.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Ordered application of state changes
//! - SI-11: Error Handling - Handler failures are logged, not fatal

use crate::error::{HandlerError, NdbError, Result};
use crate::event::Event;
use crate::queue::EventQueue;
use crate::registry::HandlerRegistry;
use crate::types::Origin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// How the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A handler requested shutdown
    Shutdown,
    /// Every queue producer is gone
    QueueClosed,
}

/// Single-threaded consumer of an [`EventQueue`]
pub struct DispatchLoop {
    queue: EventQueue,
    registry: Arc<HandlerRegistry>,
    gc_interval: Duration,
    last_sweep: Instant,
}

impl DispatchLoop {
    pub fn new(queue: EventQueue, registry: Arc<HandlerRegistry>, gc_interval: Duration) -> Self {
        Self {
            queue,
            registry,
            gc_interval,
            last_sweep: Instant::now(),
        }
    }

    /// Consume batches until shutdown
    ///
    /// Returns an error only for fatal conditions: an error event that no
    /// handler claimed. However the loop stops, the queue is closed so
    /// that producers stop piling up batches nobody will read.
    pub fn run(mut self) -> Result<LoopExit> {
        info!("Dispatch loop started");
        let exit = self.consume();
        let dropped = self.queue.close();
        if dropped > 0 {
            debug!(dropped, "Pending batches discarded");
        }
        exit
    }

    fn consume(&mut self) -> Result<LoopExit> {
        loop {
            let (origin, events) = match self.queue.get() {
                Ok(batch) => batch,
                Err(NdbError::QueueClosed) => return Ok(LoopExit::QueueClosed),
                Err(e) => return Err(e),
            };
            trace!(%origin, count = events.len(), "Dispatching batch");

            for event in &events {
                if self.dispatch(&origin, event)? == Flow::Stop {
                    info!(%origin, "Dispatch loop shutting down");
                    return Ok(LoopExit::Shutdown);
                }
            }

            self.maybe_sweep();
        }
    }

    /// Run every handler for one event
    fn dispatch(&self, origin: &Origin, event: &Event) -> Result<Flow> {
        let kind = event.kind();
        let Some(handlers) = self.registry.handlers(kind) else {
            return default_handler(origin, event);
        };

        for handler in handlers {
            match handler.invoke(origin, event) {
                Ok(()) => {}
                Err(HandlerError::Invalidate) => {
                    if self.registry.remove(kind, &handler) {
                        debug!(%origin, %kind, handler = handler.name(), "Handler invalidated");
                    } else {
                        warn!(%origin, %kind, handler = handler.name(), "Could not invalidate handler");
                    }
                }
                Err(HandlerError::Shutdown) => return Ok(Flow::Stop),
                Err(HandlerError::Failed(e)) => {
                    error!(
                        %origin,
                        %kind,
                        handler = handler.name(),
                        event = ?event,
                        error = %e,
                        "Could not load event"
                    );
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() > self.gc_interval {
            self.last_sweep = Instant::now();
            let removed = self.registry.sweep();
            debug!(removed, "Handler sweep complete");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Fallback for kinds nobody registered for
///
/// Error conditions are fatal and an unclaimed shutdown still stops the
/// loop; anything else is logged and ignored.
fn default_handler(origin: &Origin, event: &Event) -> Result<Flow> {
    match event {
        Event::Error(err) => Err(NdbError::Fatal(format!("{}: {}", origin, err))),
        Event::Shutdown => Ok(Flow::Stop),
        other => {
            warn!(%origin, kind = %other.kind(), "Unsupported event ignored");
            Ok(Flow::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, EventError, EventKind, MessageKind, ReadySignal, RtnlMessage};
    use crate::registry::Registration;
    use parking_lot::Mutex;
    use std::thread;

    fn spawn(
        queue: &EventQueue,
        registry: &Arc<HandlerRegistry>,
        gc: Duration,
    ) -> thread::JoinHandle<Result<LoopExit>> {
        let dl = DispatchLoop::new(queue.clone(), Arc::clone(registry), gc);
        thread::spawn(move || dl.run())
    }

    fn install_builtins(registry: &HandlerRegistry) {
        registry.register(
            EventKind::Ready,
            Registration::new("ready", |_, event| {
                if let Event::Ready(signal) = event {
                    signal.set();
                }
                Ok(())
            }),
        );
        registry.register(
            EventKind::Shutdown,
            Registration::new("shutdown", |_, _| Err(HandlerError::Shutdown)),
        );
    }

    fn link(index: i64) -> Event {
        RtnlMessage::new(MessageKind::Link, Action::New)
            .with("index", index)
            .into()
    }

    #[test]
    fn test_failed_handler_does_not_stop_loop() {
        let queue = EventQueue::new();
        let registry = Arc::new(HandlerRegistry::new());
        install_builtins(&registry);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.register(
            EventKind::LINK,
            Registration::new("loader", move |origin, event| {
                let index = event.as_message().and_then(|m| m.get("index")).and_then(|v| v.as_i64());
                match index {
                    Some(i) if i >= 0 => {
                        sink.lock().push((origin.clone(), i));
                        Ok(())
                    }
                    _ => Err(NdbError::MalformedEvent("bad index".into()).into()),
                }
            }),
        );

        let th = spawn(&queue, &registry, Duration::from_secs(60));
        let ready = ReadySignal::new();
        queue.put(&Origin::from("h1"), vec![link(-1)]).unwrap();
        queue
            .put(
                &Origin::from("h2"),
                vec![
                    // Unsupported kind: logged and ignored
                    RtnlMessage::new(MessageKind::Other(99), Action::New).into(),
                    link(5),
                    Event::Ready(ready.clone()),
                ],
            )
            .unwrap();
        assert!(ready.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![(Origin::from("h2"), 5)]);

        queue.put(&Origin::default(), vec![Event::Shutdown]).unwrap();
        assert_eq!(th.join().unwrap().unwrap(), LoopExit::Shutdown);
    }

    #[test]
    fn test_unhandled_error_event_is_fatal() {
        let queue = EventQueue::new();
        let registry = Arc::new(HandlerRegistry::new());
        install_builtins(&registry);
        let th = spawn(&queue, &registry, Duration::from_secs(60));

        queue
            .put(
                &Origin::from("h1"),
                vec![Event::Error(EventError {
                    code: -5,
                    message: "socket exploded".into(),
                })],
            )
            .unwrap();
        let err = th.join().unwrap().unwrap_err();
        assert!(matches!(err, NdbError::Fatal(_)));
        assert!(queue.is_closed());
        assert!(matches!(
            queue.put(&Origin::from("h1"), vec![link(1)]),
            Err(NdbError::QueueClosed)
        ));
    }

    #[test]
    fn test_invalidated_handler_is_removed_and_others_run() {
        let queue = EventQueue::new();
        let registry = Arc::new(HandlerRegistry::new());
        install_builtins(&registry);
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        registry.register(
            EventKind::LINK,
            Registration::new("once", |_, _| Err(HandlerError::Invalidate)),
        );
        registry.register(
            EventKind::LINK,
            Registration::new("count", move |_, _| {
                *counter.lock() += 1;
                Ok(())
            }),
        );

        let th = spawn(&queue, &registry, Duration::from_secs(60));
        let ready = ReadySignal::new();
        queue
            .put(&Origin::default(), vec![link(1), link(2), Event::Ready(ready.clone())])
            .unwrap();
        assert!(ready.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*hits.lock(), 2);
        assert_eq!(registry.count(EventKind::LINK), 1);

        queue.put(&Origin::default(), vec![Event::Shutdown]).unwrap();
        th.join().unwrap().unwrap();
    }

    #[test]
    fn test_sweep_runs_after_interval() {
        struct Target;
        fn noop(_: &Target, _: &Origin, _: &Event) -> crate::error::HandlerResult {
            Ok(())
        }

        let queue = EventQueue::new();
        let registry = Arc::new(HandlerRegistry::new());
        install_builtins(&registry);
        let target = Arc::new(Target);
        registry.register(EventKind::ROUTE, Registration::weak("noop", &target, noop));
        drop(target);
        assert_eq!(registry.count(EventKind::ROUTE), 1);

        let th = spawn(&queue, &registry, Duration::ZERO);
        let first = ReadySignal::new();
        queue.put(&Origin::default(), vec![Event::Ready(first.clone())]).unwrap();
        first.wait();
        // The sweep runs after the batch completes; push one more batch to
        // be sure the first one has been fully processed.
        let second = ReadySignal::new();
        queue.put(&Origin::default(), vec![Event::Ready(second.clone())]).unwrap();
        second.wait();
        queue.put(&Origin::default(), vec![Event::Shutdown]).unwrap();
        th.join().unwrap().unwrap();

        assert_eq!(registry.count(EventKind::ROUTE), 0);
    }
}
