//! Top-level scheduler loop and per-connection poll passes
//!
//! The top-level loop runs while any retrieval is registered. It discovers
//! connections nobody is polling yet and starts a pass loop for each. A pass
//! loop asks the picker what to do, runs attempt chains and rests between
//! cycles; it ends when its connection has no contexts left.

use mqpoll_core::domain::handle::{ConnectionHandle, ContextKey};
use mqpoll_core::domain::outcome::ConnectionState;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use super::Shared;
use super::executor::{self, Verdict};
use super::picker::PassDecision;

/// Top-level loop; returns once the registry is empty
pub(crate) async fn run(shared: Arc<Shared>) {
    info!("Retrieval scheduler started");

    loop {
        let tuning = shared.tuning();

        {
            let mut registry = shared.registry.lock();
            if registry.is_empty() {
                registry.driver_running = false;
                break;
            }

            for connection in registry.undiscovered() {
                registry.activate(connection);
                debug!("Polling {}", connection);
                tokio::spawn(poll_connection(Arc::clone(&shared), connection));
            }
        }

        for (connection, held) in shared.gate.stuck(tuning.stuck_call_warning) {
            warn!(
                "A call on {} has held the connection for {:?}",
                connection, held
            );
        }

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = time::sleep(tuning.idle_poll_interval) => {}
        }
    }

    info!("Retrieval scheduler stopped, nothing registered");
}

/// Keeps the registry consistent when a pass loop ends without finishing,
/// such as after a panic in a transport call
///
/// The connection is marked unpolled so the top-level loop restarts it, and
/// the context whose attempt was cut short is removed.
struct PassGuard {
    shared: Arc<Shared>,
    connection: ConnectionHandle,
    dispatched: Option<(ContextKey, u64)>,
    finished: bool,
}

impl PassGuard {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let dropped = {
            let mut registry = self.shared.registry.lock();
            registry.deactivate(self.connection);
            self.dispatched
                .and_then(|(key, generation)| registry.remove_if_current(&key, generation))
        };
        error!("Polling of {} ended abnormally", self.connection);
        if let Some(ctx) = dropped {
            warn!("Retrieval {} removed, its attempt did not complete", ctx.key);
            self.shared.counters.failed(1);
        }
        self.shared.notify_changed();
    }
}

/// Poll pass loop for one connection
async fn poll_connection(shared: Arc<Shared>, connection: ConnectionHandle) {
    let mut pass = PassGuard {
        shared: Arc::clone(&shared),
        connection,
        dispatched: None,
        finished: false,
    };
    let mut swept = HashSet::new();

    loop {
        let tuning = shared.tuning();
        let changed = shared.watch_changes();
        tokio::pin!(changed);
        changed.as_mut().enable();

        match shared.transport.connection_state(connection) {
            ConnectionState::Healthy => {}
            ConnectionState::Interrupted => {
                let abandoned = {
                    let mut registry = shared.registry.lock();
                    let empty = !registry.has_connection(connection);
                    if empty {
                        registry.deactivate(connection);
                    }
                    empty
                };
                if abandoned {
                    debug!("Stopped polling {} while interrupted", connection);
                    shared.gate.forget(connection);
                    pass.finish();
                    return;
                }
                warn!("{} is interrupted, skipping this cycle", connection);
                shared.rest(tuning.idle_poll_interval, changed).await;
                continue;
            }
            ConnectionState::Closed => shared.fail_connection(connection),
        }

        let decision = {
            let mut registry = shared.registry.lock();
            shared.picker.decide(
                &mut registry,
                connection,
                &tuning,
                &mut swept,
                Instant::now(),
            )
        };

        match decision {
            PassDecision::Abandon => {
                debug!("Stopped polling {}", connection);
                shared.gate.forget(connection);
                pass.finish();
                return;
            }
            PassDecision::Delay(delay) => {
                trace!("{} resting for {:?}", connection, delay);
                shared.rest(delay, changed).await;
            }
            PassDecision::Dispatch { key, generation } => {
                pass.dispatched = Some((key, generation));
                let verdict = executor::attempt(&shared, key, generation).await;
                pass.dispatched = None;
                if verdict == Verdict::NoData {
                    swept.insert(key.object);
                }
            }
        }
    }
}
