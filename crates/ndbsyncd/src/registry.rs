//! Handler registry: event kind to an ordered list of handlers
//!
//! Handlers are either owned closures (store bindings, built-ins) or weak
//! registrations that point at a live object without keeping it alive.
//! A weak registration whose target is gone answers every invocation with
//! [`HandlerError::Invalidate`], so a dead entry never fires; the periodic
//! [`sweep`](HandlerRegistry::sweep) only compacts the lists.

use crate::error::{HandlerError, HandlerResult};
use crate::event::{Event, EventKind};
use crate::types::Origin;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

type Callback = dyn Fn(&Origin, &Event) -> HandlerResult + Send + Sync;
type Liveness = dyn Fn() -> bool + Send + Sync;

/// One `(kind, target, callback name)` binding
pub struct Registration {
    name: String,
    call: Box<Callback>,
    liveness: Option<Box<Liveness>>,
}

impl Registration {
    /// A handler owned by the registry
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Origin, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: Box::new(handler),
            liveness: None,
        }
    }

    /// A handler that calls `callback` on `target` for as long as the
    /// target is referenced elsewhere
    pub fn weak<T>(
        name: impl Into<String>,
        target: &Arc<T>,
        callback: fn(&T, &Origin, &Event) -> HandlerResult,
    ) -> Self
    where
        T: Send + Sync + 'static,
    {
        let wr: Weak<T> = Arc::downgrade(target);
        let alive = wr.clone();
        Self {
            name: name.into(),
            call: Box::new(move |origin, event| match wr.upgrade() {
                Some(target) => callback(&target, origin, event),
                None => Err(HandlerError::Invalidate),
            }),
            liveness: Some(Box::new(move || alive.strong_count() > 0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the handler is owned or its weak target still exists
    pub fn is_alive(&self) -> bool {
        self.liveness.as_ref().is_none_or(|alive| alive())
    }

    pub fn is_weak(&self) -> bool {
        self.liveness.is_some()
    }

    pub fn invoke(&self, origin: &Origin, event: &Event) -> HandlerResult {
        (self.call)(origin, event)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("weak", &self.is_weak())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Event kind to handler list mapping, shared by the dispatch loop and
/// the threads that create live objects
#[derive(Default)]
pub struct HandlerRegistry {
    map: Mutex<HashMap<EventKind, Vec<Arc<Registration>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the list for `kind`
    pub fn register(&self, kind: EventKind, registration: Registration) -> Arc<Registration> {
        let registration = Arc::new(registration);
        self.map
            .lock()
            .entry(kind)
            .or_default()
            .push(Arc::clone(&registration));
        registration
    }

    /// Stable copy of the handler list for `kind`
    ///
    /// `None` means nothing was ever registered for the kind and the
    /// caller should fall back to its default handler. Handlers may
    /// register or remove entries while the copy is being iterated.
    pub fn handlers(&self, kind: EventKind) -> Option<Vec<Arc<Registration>>> {
        self.map.lock().get(&kind).cloned()
    }

    /// Remove exactly this registration from the list for `kind`
    pub fn remove(&self, kind: EventKind, registration: &Arc<Registration>) -> bool {
        let mut map = self.map.lock();
        let Some(list) = map.get_mut(&kind) else {
            return false;
        };
        match list.iter().position(|r| Arc::ptr_eq(r, registration)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drop every registration whose weak target no longer exists
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let mut map = self.map.lock();
        let mut removed = 0;
        for (kind, list) in map.iter_mut() {
            let before = list.len();
            list.retain(|r| r.is_alive());
            let pruned = before - list.len();
            if pruned > 0 {
                debug!(%kind, pruned, "Swept dead handlers");
            }
            removed += pruned;
        }
        removed
    }

    /// Number of handlers registered for `kind`
    pub fn count(&self, kind: EventKind) -> usize {
        self.map.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Number of weak registrations for `kind`
    pub fn weak_count(&self, kind: EventKind) -> usize {
        self.map
            .lock()
            .get(&kind)
            .map_or(0, |list| list.iter().filter(|r| r.is_weak()).count())
    }

    /// Total number of registrations across all kinds
    pub fn len(&self) -> usize {
        self.map.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ReadySignal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
    }

    impl Counter {
        fn on_event(&self, _origin: &Origin, _event: &Event) -> HandlerResult {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ready() -> Event {
        Event::Ready(ReadySignal::new())
    }

    #[test]
    fn test_register_preserves_order() {
        let registry = HandlerRegistry::new();
        registry.register(EventKind::Ready, Registration::new("first", |_, _| Ok(())));
        registry.register(EventKind::Ready, Registration::new("second", |_, _| Ok(())));

        let names: Vec<String> = registry
            .handlers(EventKind::Ready)
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(registry.handlers(EventKind::Shutdown).is_none());
    }

    #[test]
    fn test_weak_handler_fires_while_alive() {
        let registry = HandlerRegistry::new();
        let counter = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let reg = registry.register(
            EventKind::Ready,
            Registration::weak("on_event", &counter, Counter::on_event),
        );

        reg.invoke(&Origin::default(), &ready()).unwrap();
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
        assert!(reg.is_alive());

        drop(counter);
        assert!(!reg.is_alive());
        assert!(matches!(
            reg.invoke(&Origin::default(), &ready()),
            Err(HandlerError::Invalidate)
        ));
    }

    #[test]
    fn test_sweep_removes_only_dead_entries() {
        let registry = HandlerRegistry::new();
        let keep = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let gone = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        registry.register(EventKind::Ready, Registration::new("owned", |_, _| Ok(())));
        registry.register(
            EventKind::Ready,
            Registration::weak("keep", &keep, Counter::on_event),
        );
        registry.register(
            EventKind::Ready,
            Registration::weak("gone", &gone, Counter::on_event),
        );
        assert_eq!(registry.count(EventKind::Ready), 3);

        // Nothing is pruned while every target is reachable
        assert_eq!(registry.sweep(), 0);

        drop(gone);
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.count(EventKind::Ready), 2);
        assert_eq!(registry.weak_count(EventKind::Ready), 1);
    }

    #[test]
    fn test_remove_exact_registration() {
        let registry = HandlerRegistry::new();
        let a = registry.register(EventKind::Error, Registration::new("a", |_, _| Ok(())));
        let b = registry.register(EventKind::Error, Registration::new("a", |_, _| Ok(())));

        assert!(registry.remove(EventKind::Error, &a));
        assert!(!registry.remove(EventKind::Error, &a));
        let left = registry.handlers(EventKind::Error).unwrap();
        assert_eq!(left.len(), 1);
        assert!(Arc::ptr_eq(&left[0], &b));
    }

    #[test]
    fn test_register_during_iteration() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register(
            EventKind::Ready,
            Registration::new("spawner", move |_, _| {
                inner.register(EventKind::Ready, Registration::new("child", |_, _| Ok(())));
                Ok(())
            }),
        );

        for handler in registry.handlers(EventKind::Ready).unwrap() {
            handler.invoke(&Origin::default(), &ready()).unwrap();
        }
        assert_eq!(registry.count(EventKind::Ready), 2);
    }
}
