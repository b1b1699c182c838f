//! Retrieval attempt executor
//!
//! Runs the attempt chain for one picked context: truncations retry at once
//! with a doubled buffer, deliveries keep draining up to the per-object cap,
//! and everything else hands control back to the connection's pass.

use bytes::Bytes;
use mqpoll_core::domain::handle::ContextKey;
use mqpoll_core::domain::outcome::{ConnectionState, GetOutcome};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::Shared;
use super::context::{BufferPolicy, Flight};
use crate::error::RetrievalError;
use crate::handler::Delivery;

/// How an attempt chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Drain cap reached; another object gets a turn
    Rotate,
    /// Nothing available and other contexts are waiting for a turn
    NoData,
    /// Terminal condition delivered, context removed
    Terminated,
    /// Cancelled or replaced while the chain ran
    Gone,
    /// The connection is temporarily unusable; nothing was attempted
    Interrupted,
}

/// Runs attempts for one registration until it yields
pub(crate) async fn attempt(shared: &Arc<Shared>, key: ContextKey, generation: u64) -> Verdict {
    loop {
        let tuning = shared.tuning();
        let policy = BufferPolicy::from(&tuning);

        let gate = shared.gate.enter(key.connection).await;

        if shared.transport.connection_state(key.connection) == ConnectionState::Interrupted {
            gate.leave();
            shared.release(&key, generation);
            return Verdict::Interrupted;
        }

        let flight = {
            let mut registry = shared.registry.lock();
            registry
                .current_mut(&key, generation)
                .map(|ctx| ctx.check_out())
        };
        let Some(mut flight) = flight else {
            debug!("Retrieval {} went away before its attempt", key);
            return Verdict::Gone;
        };

        // The scheduler does the waiting; the call itself must never block
        let options = flight.options.non_blocking();
        let outcome = shared
            .transport
            .get(
                key.connection,
                key.object,
                &mut flight.descriptor,
                &options,
                flight.buffer.as_mut_slice(),
            )
            .await;
        gate.leave();

        let now = Instant::now();
        match outcome {
            GetOutcome::Truncated { data_length } => {
                let offered = flight.buffer.capacity();
                if !flight.buffer.grow(&policy) {
                    let error = RetrievalError::MessageTooLarge {
                        needed: data_length,
                        limit: policy.max,
                    };
                    return terminate(shared, flight, error);
                }
                debug!(
                    "Retrieval {} truncated ({} > {} bytes), retrying with {} bytes",
                    key,
                    data_length,
                    offered,
                    flight.buffer.capacity()
                );
                if !shared.check_in(&key, generation, flight.buffer) {
                    return Verdict::Gone;
                }
            }

            GetOutcome::NoData => {
                let changed = shared.watch_changes();
                tokio::pin!(changed);
                changed.as_mut().enable();

                if flight.wait_expired(now) {
                    let waited = now.saturating_duration_since(flight.wait_started);
                    return terminate(shared, flight, RetrievalError::Timeout { waited });
                }

                let remaining = flight.remaining_wait(now);
                if !shared.check_in(&key, generation, flight.buffer) {
                    return Verdict::Gone;
                }

                let outstanding = shared.registry.lock().len();
                if outstanding > tuning.sole_context_threshold {
                    shared.release(&key, generation);
                    return Verdict::NoData;
                }

                // Nobody else to yield to: wait here instead
                let delay = remaining.map_or(tuning.idle_poll_interval, |left| {
                    left.min(tuning.idle_poll_interval)
                });
                trace!("Retrieval {} is alone, next attempt in {:?}", key, delay);
                shared.rest(delay, changed).await;
            }

            GetOutcome::Failed(error) => {
                return terminate(shared, flight, RetrievalError::from_transport(error));
            }

            GetOutcome::Message { data_length } => {
                shared.registry.lock().record_retrieval(key.connection);
                shared.counters.delivered();

                let mut delivery = Delivery {
                    connection: key.connection,
                    object: key.object,
                    options: flight.options,
                    descriptor: flight.descriptor,
                    payload: Bytes::copy_from_slice(flight.buffer.filled(data_length)),
                };
                if !shared.invoke(flight.handler.as_ref(), &key, Ok(&mut delivery)) {
                    return drop_after_panic(shared, &key, generation);
                }

                let drained = {
                    let mut registry = shared.registry.lock();
                    registry.current_mut(&key, generation).map(|ctx| {
                        ctx.delivered(
                            flight.buffer,
                            data_length,
                            delivery.options,
                            &policy,
                            Instant::now(),
                        )
                    })
                };
                let Some(drained) = drained else {
                    debug!("Retrieval {} cancelled by its handler", key);
                    return Verdict::Gone;
                };

                if drained >= tuning.max_consecutive_gets {
                    trace!("Retrieval {} drained {} message(s), rotating", key, drained);
                    shared.release(&key, generation);
                    return Verdict::Rotate;
                }
            }
        }
    }
}

/// Removes the context and reports the terminal condition to its handler
///
/// The handler is skipped when the registration was already cancelled or
/// replaced, so it sees at most one terminal call.
fn terminate(shared: &Arc<Shared>, flight: Flight, error: RetrievalError) -> Verdict {
    let removed = shared
        .registry
        .lock()
        .remove_if_current(&flight.key, flight.generation)
        .is_some();

    if removed {
        if error.is_timeout() {
            info!("Retrieval {} ended: {}", flight.key, error);
            shared.counters.timed_out();
        } else {
            warn!("Retrieval {} failed: {}", flight.key, error);
            shared.counters.failed(1);
        }
        shared.notify_changed();
        shared.invoke(flight.handler.as_ref(), &flight.key, Err(error));
    }

    Verdict::Terminated
}

/// Removes a registration whose handler panicked
///
/// The handler is not called again, not even with a terminal error.
fn drop_after_panic(shared: &Arc<Shared>, key: &ContextKey, generation: u64) -> Verdict {
    let removed = shared
        .registry
        .lock()
        .remove_if_current(key, generation)
        .is_some();

    if removed {
        warn!("Retrieval {} removed after its handler panicked", key);
        shared.counters.failed(1);
        shared.notify_changed();
    }

    Verdict::Terminated
}
