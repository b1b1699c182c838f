//! Emulated-asynchronous retrieval scheduler
//!
//! The transport only offers a point-in-time receive. This layer turns it
//! into "call my handler whenever a message arrives" by polling every
//! registered (connection, object) pair with non-blocking attempts, spread
//! fairly across objects and connections, while keeping at most one call
//! in flight per connection handle.

mod context;
mod driver;
mod executor;
mod gate;
mod picker;
mod registry;

pub use gate::GateGuard;

use mqpoll_core::domain::connection::ConnectOptions;
use mqpoll_core::domain::handle::{ConnectionHandle, ContextKey, ObjectHandle};
use mqpoll_core::domain::message::{GetOptions, MessageDescriptor};
use mqpoll_core::domain::outcome::{ReasonCode, TransportError};
use mqpoll_core::domain::tuning::Tuning;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::error::{ClientError, Result, RetrievalError};
use crate::handler::{Delivery, RetrievalHandler};
use crate::transport::Transport;
use context::{ReceiveBuffer, RetrievalContext};
use gate::ConnectionGate;
use picker::FairnessPicker;
use registry::Registry;

/// Snapshot of scheduler activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Registered retrievals
    pub contexts: usize,
    /// Connections with a running poll loop
    pub active_connections: usize,
    /// Whether the top-level loop is alive
    pub running: bool,
    /// Messages handed to handlers
    pub delivered: u64,
    /// Retrievals ended by an exhausted wait budget
    pub timeouts: u64,
    /// Retrievals ended by any other terminal condition
    pub failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    delivered: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    pub fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, count: u64) {
        self.failures.fetch_add(count, Ordering::Relaxed);
    }
}

/// State shared by the public handle, the top-level loop and the pass loops
pub(crate) struct Shared {
    pub transport: Arc<dyn Transport>,
    pub registry: Mutex<Registry>,
    pub gate: ConnectionGate,
    pub picker: FairnessPicker,
    pub counters: Counters,
    tuning: RwLock<Tuning>,
    /// Wakes the top-level loop
    wake: Notify,
    /// Wakes resting pass loops after the registry changed
    changed: Notify,
    runtime: Handle,
}

impl Shared {
    pub fn tuning(&self) -> Tuning {
        self.tuning.read().clone()
    }

    /// Registry-change notification, armed before the caller looks at the
    /// registry so a change made in between is not missed
    pub fn watch_changes(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Sleeps for `delay`, or less if `changed` fires meanwhile
    pub async fn rest(&self, delay: Duration, changed: Pin<&mut Notified<'_>>) {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = changed => {}
        }
    }

    /// Calls a handler, containing any panic it raises
    ///
    /// Returns false when the handler panicked.
    pub fn invoke(
        &self,
        handler: &dyn RetrievalHandler,
        key: &ContextKey,
        result: std::result::Result<&mut Delivery, RetrievalError>,
    ) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(result))) {
            Ok(()) => true,
            Err(_) => {
                error!("Handler for {} panicked", key);
                false
            }
        }
    }

    pub fn notify_changed(&self) {
        self.changed.notify_waiters();
        self.wake.notify_one();
    }

    /// Returns the buffer to a context that is still current
    pub fn check_in(&self, key: &ContextKey, generation: u64, buffer: ReceiveBuffer) -> bool {
        match self.registry.lock().current_mut(key, generation) {
            Some(ctx) => {
                ctx.check_in(buffer);
                true
            }
            None => false,
        }
    }

    /// Makes a context eligible for picking again
    pub fn release(&self, key: &ContextKey, generation: u64) {
        if let Some(ctx) = self.registry.lock().current_mut(key, generation) {
            ctx.release();
        }
    }

    /// Ends every retrieval on a connection that is gone for good
    pub fn fail_connection(&self, connection: ConnectionHandle) {
        let removed = self.registry.lock().remove_connection(connection);
        if removed.is_empty() {
            return;
        }

        error!(
            "{} closed, ending {} retrieval(s)",
            connection,
            removed.len()
        );
        self.counters.failed(removed.len() as u64);
        self.notify_changed();

        for ctx in removed {
            let error = RetrievalError::ConnectionBroken(TransportError::new(
                ReasonCode::ConnectionBroken,
                "connection closed",
            ));
            self.invoke(ctx.handler.as_ref(), &ctx.key, Err(error));
        }
    }

    fn ensure_driver(self: &Arc<Self>, registry: &mut Registry) {
        if !registry.driver_running {
            registry.driver_running = true;
            self.runtime.spawn(driver::run(Arc::clone(self)));
        }
    }
}

/// Retrieval scheduler
///
/// Cheap to clone; all clones drive the same registrations. Must be created
/// inside a tokio runtime, which runs the polling tasks.
///
/// # Example
/// ```no_run
/// use mqpoll_client::{MemoryTransport, Scheduler, handler_fn};
/// use mqpoll_core::domain::message::{GetOptions, MessageDescriptor, WaitInterval};
/// use mqpoll_core::domain::tuning::Tuning;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let transport = Arc::new(MemoryTransport::new());
///     let scheduler = Scheduler::new(transport.clone(), Tuning::default())?;
///
///     let conn = transport.connect(scheduler.connect_options());
///     let queue = transport.open(conn, "DEV.QUEUE.1")?;
///
///     scheduler.register_retrieval(
///         conn,
///         queue,
///         MessageDescriptor::default(),
///         GetOptions::waiting(WaitInterval::Unlimited),
///         handler_fn(|result| match result {
///             Ok(delivery) => println!("got {} bytes", delivery.payload.len()),
///             Err(e) => eprintln!("retrieval ended: {}", e),
///         }),
///     );
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler over `transport`
    ///
    /// Fails when the tuning is invalid or no tokio runtime is running.
    pub fn new(transport: Arc<dyn Transport>, tuning: Tuning) -> Result<Self> {
        tuning.validate()?;
        let runtime = Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                registry: Mutex::new(Registry::default()),
                gate: ConnectionGate::new(),
                picker: FairnessPicker::new(),
                counters: Counters::default(),
                tuning: RwLock::new(tuning),
                wake: Notify::new(),
                changed: Notify::new(),
                runtime,
            }),
        })
    }

    /// Makes the fairness picker deterministic
    pub fn seed_picker(&self, seed: u64) {
        self.shared.picker.reseed(seed);
    }

    /// Registers a retrieval, replacing any previous one for the same object
    ///
    /// The handler is called with every message until the registration is
    /// cancelled, or once with a terminal error. Starts the scheduler if it
    /// is dormant. The connection needs no prior introduction.
    pub fn register_retrieval(
        &self,
        connection: ConnectionHandle,
        object: ObjectHandle,
        descriptor: MessageDescriptor,
        options: GetOptions,
        handler: impl RetrievalHandler,
    ) {
        let key = ContextKey::new(connection, object);
        let tuning = self.shared.tuning();
        let handler: Arc<dyn RetrievalHandler> = Arc::new(handler);

        {
            let mut registry = self.shared.registry.lock();
            let generation = registry.next_generation();
            let context = RetrievalContext::new(
                key,
                generation,
                options,
                descriptor,
                handler,
                tuning.min_buffer_size,
                Instant::now(),
            );

            if registry.insert(context).is_some() {
                debug!("Replaced retrieval {}", key);
            } else {
                debug!("Registered retrieval {}", key);
            }
            self.shared.ensure_driver(&mut registry);
        }

        self.shared.notify_changed();
    }

    /// Cancels a retrieval
    ///
    /// An attempt already in flight completes but the context is not
    /// revived. Returns [`ClientError::UnknownContext`] if nothing is
    /// registered for the object.
    pub fn cancel_retrieval(&self, connection: ConnectionHandle, object: ObjectHandle) -> Result<()> {
        let key = ContextKey::new(connection, object);
        let removed = self.shared.registry.lock().remove(&key);

        match removed {
            Some(_) => {
                debug!("Cancelled retrieval {}", key);
                self.shared.notify_changed();
                Ok(())
            }
            None => Err(ClientError::UnknownContext(key)),
        }
    }

    /// Drops every retrieval on a connection the application is tearing down
    ///
    /// Handlers are not called. Returns how many retrievals were removed.
    pub fn forget_connection(&self, connection: ConnectionHandle) -> usize {
        let removed = self.shared.registry.lock().remove_connection(connection);
        if !removed.is_empty() {
            info!(
                "Forgot {} retrieval(s) on {}",
                removed.len(),
                connection
            );
            self.shared.notify_changed();
        }
        removed.len()
    }

    /// Cancels every retrieval; the scheduler goes dormant
    pub fn cancel_all(&self) -> usize {
        let count = self.shared.registry.lock().clear();
        if count > 0 {
            info!("Cancelled {} retrieval(s)", count);
            self.shared.notify_changed();
        }
        count
    }

    /// Takes the connection's gate for the application's own calls
    ///
    /// No retrieval attempt runs on the connection while the guard lives.
    pub async fn lock_connection(&self, connection: ConnectionHandle) -> GateGuard {
        self.shared.gate.enter(connection).await
    }

    /// How long the connection's current gate holder has held it
    pub fn gate_held_for(&self, connection: ConnectionHandle) -> Option<Duration> {
        self.shared.gate.held_for(connection)
    }

    /// Default connect options for the configured share mode
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::for_share_mode(self.shared.tuning.read().handle_share_mode)
    }

    pub fn tuning(&self) -> Tuning {
        self.shared.tuning()
    }

    /// Replaces the tuning; takes effect at the next scheduling decision
    pub fn set_tuning(&self, tuning: Tuning) -> Result<()> {
        tuning.validate()?;
        *self.shared.tuning.write() = tuning;
        self.shared.notify_changed();
        Ok(())
    }

    /// Whether the top-level loop is alive
    pub fn is_running(&self) -> bool {
        self.shared.registry.lock().driver_running
    }

    pub fn is_registered(&self, connection: ConnectionHandle, object: ObjectHandle) -> bool {
        self.shared
            .registry
            .lock()
            .contains(&ContextKey::new(connection, object))
    }

    pub fn context_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Current receive buffer size of a registration
    ///
    /// Reads zero while an attempt has the buffer checked out.
    pub fn buffer_capacity(&self, connection: ConnectionHandle, object: ObjectHandle) -> Option<usize> {
        self.shared
            .registry
            .lock()
            .get(&ContextKey::new(connection, object))
            .map(|ctx| ctx.buffer_capacity())
    }

    pub fn stats(&self) -> SchedulerStats {
        let (contexts, active_connections, running) = {
            let registry = self.shared.registry.lock();
            (
                registry.len(),
                registry.active_connections(),
                registry.driver_running,
            )
        };
        let counters = &self.shared.counters;

        SchedulerStats {
            contexts,
            active_connections,
            running,
            delivered: counters.delivered.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::transport::MemoryTransport;
    use mqpoll_core::domain::message::WaitInterval;

    fn scheduler() -> (Arc<MemoryTransport>, Scheduler) {
        let transport = Arc::new(MemoryTransport::new());
        let scheduler = Scheduler::new(transport.clone(), Tuning::default()).unwrap();
        (transport, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_sees_change_made_before_it_starts() {
        let (_transport, scheduler) = scheduler();
        let shared = &scheduler.shared;

        let changed = shared.watch_changes();
        tokio::pin!(changed);
        changed.as_mut().enable();

        // Lands between the caller's registry check and its rest
        shared.notify_changed();

        let start = Instant::now();
        shared.rest(Duration::from_secs(10), changed).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_runs_full_delay_without_change() {
        let (_transport, scheduler) = scheduler();
        let shared = &scheduler.shared;

        let changed = shared.watch_changes();
        tokio::pin!(changed);
        changed.as_mut().enable();

        let start = Instant::now();
        shared.rest(Duration::from_secs(3), changed).await;
        assert_eq!(Instant::now(), start + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_connection_releases_gate_when_emptied() {
        let (transport, scheduler) = scheduler();
        let conn = transport.connect(scheduler.connect_options());
        let q = transport.open(conn, "Q.INTERRUPTED").unwrap();

        scheduler.register_retrieval(
            conn,
            q,
            MessageDescriptor::default(),
            GetOptions::waiting(WaitInterval::Unlimited),
            handler_fn(|_result: std::result::Result<&mut Delivery, RetrievalError>| {}),
        );
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.shared.gate.tracked(), 1);

        transport.interrupt(conn, true);
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(scheduler.forget_connection(conn), 1);
        time::sleep(Duration::from_secs(11)).await;

        assert_eq!(scheduler.shared.gate.tracked(), 0);
        assert_eq!(scheduler.stats().active_connections, 0);
        assert!(!scheduler.is_running());
    }
}
