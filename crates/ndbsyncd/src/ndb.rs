//! The coordinator: store, registry, dispatch thread and sources
//!
//! [`Ndb`] wires the pieces together. Sources push batches into one
//! [`EventQueue`]; the `ndb-main` thread runs the [`DispatchLoop`] that
//! applies them to the [`Store`] and to live objects; callers query the
//! store through [`View`]s from their own threads.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Attached origins and their state
//! - SI-4: System Monitoring - Continuous mirroring of network state
//! - AU-12: Audit Record Generation - Lifecycle events are logged
//! - CP-10: System Recovery - Re-attaching an origin discards its stale rows

use crate::config::NdbConfig;
use crate::dispatch::{DispatchLoop, LoopExit};
use crate::error::{HandlerError, NdbError, Result};
use crate::event::{Event, EventKind, ReadySignal};
use crate::kinds::ObjectKind;
use crate::queue::EventQueue;
use crate::registry::{HandlerRegistry, Registration};
use crate::source::Source;
use crate::store::Store;
use crate::transport::{FileTransport, Transport};
use crate::types::{Origin, Record, Value};
use crate::view::View;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// How often a waiting [`Ndb::sync`] checks that the loop is still alive
const SYNC_POLL: Duration = Duration::from_millis(100);

/// Network state database
pub struct Ndb {
    config: NdbConfig,
    store: Arc<Store>,
    registry: Arc<HandlerRegistry>,
    queue: EventQueue,
    sources: Mutex<BTreeMap<Origin, Source>>,
    main: Mutex<Option<JoinHandle<Result<LoopExit>>>>,
    closed: Mutex<bool>,
}

impl Ndb {
    /// Open the store, start the dispatch thread and attach the initial
    /// sources
    ///
    /// File sources named in `config.sources` are attached along with
    /// `sources`. Returns once every initial dump has been applied, or
    /// fails with [`NdbError::Timeout`] after `startup_timeout_ms`.
    #[instrument(skip_all)]
    pub fn new(config: NdbConfig, sources: Vec<(Origin, Arc<dyn Transport>)>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(Store::open(&config.db, config.rtnl_log)?);

        let registry = Arc::new(HandlerRegistry::new());
        for (kind, registration) in store.event_bindings() {
            registry.register(kind, registration);
        }
        registry.register(
            EventKind::Ready,
            Registration::new("set_ready", |_, event| {
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

        let queue = EventQueue::new();
        let dispatch = DispatchLoop::new(queue.clone(), Arc::clone(&registry), config.gc_interval());
        let main = thread::Builder::new()
            .name("ndb-main".to_string())
            .spawn(move || {
                let exit = dispatch.run();
                match &exit {
                    Ok(how) => info!(exit = ?how, "Dispatch loop stopped"),
                    Err(e) => error!(error = %e, "Dispatch loop failed"),
                }
                exit
            })?;

        let ndb = Self {
            config,
            store,
            registry,
            queue,
            sources: Mutex::new(BTreeMap::new()),
            main: Mutex::new(Some(main)),
            closed: Mutex::new(false),
        };

        let mut initial = Vec::new();
        for (name, path) in &ndb.config.sources {
            let transport: Arc<dyn Transport> = Arc::new(FileTransport::open(path)?);
            initial.push((Origin::new(name.as_str()), transport));
        }
        initial.extend(sources);
        for (origin, transport) in initial {
            ndb.attach(origin, transport, None)?;
        }

        let ready = ReadySignal::new();
        ndb.queue
            .put(&ndb.config.default_origin, vec![Event::Ready(ready.clone())])?;
        if !ready.wait_timeout(ndb.config.startup_timeout()) {
            return Err(NdbError::Timeout("dispatch loop startup".to_string()));
        }
        info!(sources = ndb.sources.lock().len(), "Network state database ready");
        Ok(ndb)
    }

    /// Attach (or re-attach) a source for `origin`
    ///
    /// Any previous source for the origin is closed and the origin's rows
    /// are flushed before the new source enqueues its initial state. If
    /// `ready` is given it is set once that state has been applied.
    #[instrument(skip(self, transport, ready), fields(origin = %origin))]
    pub fn attach(
        &self,
        origin: Origin,
        transport: Arc<dyn Transport>,
        ready: Option<ReadySignal>,
    ) -> Result<()> {
        if *self.closed.lock() {
            return Err(NdbError::Closed);
        }
        if let Some(ready) = &ready {
            ready.clear();
        }

        let mut sources = self.sources.lock();
        if let Some(mut old) = sources.remove(&origin) {
            info!("Replacing source");
            if let Err(e) = old.close() {
                warn!(error = %e, "Previous source failed");
            }
        }
        // Batches the old source already queued must land before the flush
        if self.is_running() {
            self.sync()?;
        }
        let flushed = self.store.flush(&origin)?;
        debug!(flushed, "Stale rows flushed");

        let mut source = Source::new(origin.clone(), transport, self.queue.clone(), ready);
        source.start()?;
        sources.insert(origin, source);
        Ok(())
    }

    /// Close the source for `origin`; with `flush`, also drop its rows
    #[instrument(skip(self), fields(origin = %origin))]
    pub fn detach(&self, origin: &Origin, flush: bool) -> Result<()> {
        let Some(mut source) = self.sources.lock().remove(origin) else {
            return Err(NdbError::SourceNotFound(origin.clone()));
        };
        let closed = source.close();
        if flush {
            self.sync()?;
            let flushed = self.store.flush(origin)?;
            debug!(flushed, "Origin rows flushed");
        }
        info!(flush, "Source detached");
        closed
    }

    /// Wait until every batch queued so far has been applied
    pub fn sync(&self) -> Result<()> {
        let ready = ReadySignal::new();
        if self
            .queue
            .put(&self.config.default_origin, vec![Event::Ready(ready.clone())])
            .is_err()
        {
            return Err(NdbError::Closed);
        }
        while !ready.wait_timeout(SYNC_POLL) {
            if !self.is_running() {
                return Err(NdbError::Closed);
            }
        }
        Ok(())
    }

    /// Batches waiting for the dispatch loop
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// True while the dispatch thread is alive
    ///
    /// Once the loop has stopped the queue refuses batches: sources stop
    /// reading and `attach` and `sync` fail.
    pub fn is_running(&self) -> bool {
        self.main
            .lock()
            .as_ref()
            .is_some_and(|th| !th.is_finished())
    }

    /// Stop everything and close the store
    ///
    /// Safe to call more than once; later calls do nothing. The first
    /// failure met while tearing down is returned, including a fatal
    /// dispatch-loop exit.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;

        let mut first_error = None;
        let mut sources = std::mem::take(&mut *self.sources.lock());

        for origin in std::iter::once(&self.config.default_origin).chain(sources.keys()) {
            if let Err(e) = self.queue.put(origin, vec![Event::Shutdown]) {
                debug!(%origin, error = %e, "Could not enqueue shutdown");
            }
        }
        for (origin, source) in sources.iter_mut() {
            if let Err(e) = source.close() {
                error!(%origin, error = %e, "Source failed");
                first_error.get_or_insert(e);
            }
        }
        drop(sources);

        let main = self.main.lock().take();
        if let Some(main) = main {
            match main.join() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(NdbError::Fatal("dispatch loop panicked".to_string()));
                }
            }
        }

        if let Err(e) = self.store.commit().and_then(|()| self.store.close()) {
            error!(error = %e, "Store failed while closing");
            first_error.get_or_insert(e);
        }
        info!("Network state database closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Register an extra handler with the dispatch loop
    pub fn register_handler(&self, kind: EventKind, handler: Registration) -> Arc<Registration> {
        self.registry.register(kind, handler)
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &NdbConfig {
        &self.config
    }

    /// Origins with an attached source
    pub fn sources(&self) -> Vec<Origin> {
        self.sources.lock().keys().cloned().collect()
    }

    /// Run a statement directly against the store
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.store.execute(sql, params)
    }

    /// Run a query directly against the store
    pub fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        self.store.fetch(sql, params)
    }

    pub fn view(&self, kind: ObjectKind) -> View {
        View::new(
            kind,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.default_origin.clone(),
        )
    }

    pub fn interfaces(&self) -> View {
        self.view(ObjectKind::Interface)
    }

    pub fn bridges(&self) -> View {
        self.view(ObjectKind::Bridge)
    }

    pub fn vlans(&self) -> View {
        self.view(ObjectKind::Vlan)
    }

    pub fn addresses(&self) -> View {
        self.view(ObjectKind::Address)
    }

    pub fn routes(&self) -> View {
        self.view(ObjectKind::Route)
    }

    pub fn neighbours(&self) -> View {
        self.view(ObjectKind::Neighbour)
    }
}

impl Drop for Ndb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Network state database failed while closing");
        }
    }
}
