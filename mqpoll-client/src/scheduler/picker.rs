//! Fairness picker
//!
//! Chooses which context on a connection gets the next attempt chain, or
//! how long the connection should rest first. Selection is a uniform random
//! choice among the eligible contexts so a busy queue cannot starve a quiet
//! one without keeping any per-context history.

use mqpoll_core::domain::handle::{ConnectionHandle, ContextKey, ObjectHandle};
use mqpoll_core::domain::tuning::Tuning;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use super::registry::Registry;

/// What a connection's poll pass should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassDecision {
    /// No contexts left on the connection; polling for it stops
    Abandon,
    /// Re-pass after this delay
    Delay(Duration),
    /// Run an attempt chain for this registration
    Dispatch { key: ContextKey, generation: u64 },
}

pub(crate) struct FairnessPicker {
    rng: Mutex<StdRng>,
}

impl FairnessPicker {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[cfg(test)]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    /// Picks uniformly among `candidates`
    pub fn choose<T: Copy>(&self, candidates: &[T]) -> Option<T> {
        candidates.choose(&mut *self.rng.lock()).copied()
    }

    /// Decides the next step for one connection
    ///
    /// `swept` holds the objects that reported no data since the connection
    /// last retrieved anything. Once every running context is in it the
    /// connection rests for the idle interval, clamped to the nearest wait
    /// deadline so timeouts surface on time.
    pub fn decide(
        &self,
        registry: &mut Registry,
        connection: ConnectionHandle,
        tuning: &Tuning,
        swept: &mut HashSet<ObjectHandle>,
        now: Instant,
    ) -> PassDecision {
        if !registry.has_connection(connection) {
            registry.deactivate(connection);
            return PassDecision::Abandon;
        }

        if registry.take_retrieved(connection) > 0 {
            swept.clear();
            return PassDecision::Delay(tuning.inter_cycle_delay);
        }

        let contexts = registry.list_for_connection(connection);
        let candidates: Vec<(ContextKey, u64)> = Registry::list_running(&contexts)
            .into_iter()
            .filter(|ctx| !swept.contains(&ctx.key.object))
            .map(|ctx| (ctx.key, ctx.generation))
            .collect();

        let Some((key, generation)) = self.choose(&candidates) else {
            swept.clear();
            let idle = registry
                .earliest_deadline(connection, now)
                .map_or(tuning.idle_poll_interval, |left| left.min(tuning.idle_poll_interval));
            return PassDecision::Delay(idle);
        };

        if let Some(ctx) = registry.current_mut(&key, generation) {
            ctx.dispatch();
        }
        PassDecision::Dispatch { key, generation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::scheduler::context::RetrievalContext;
    use mqpoll_core::domain::message::{GetOptions, MessageDescriptor, WaitInterval};
    use std::collections::HashMap;
    use std::sync::Arc;

    const CONN: ConnectionHandle = ConnectionHandle(1);

    fn add(registry: &mut Registry, object: u64, options: GetOptions) -> ContextKey {
        let key = ContextKey::new(CONN, ObjectHandle(object));
        let generation = registry.next_generation();
        registry.insert(RetrievalContext::new(
            key,
            generation,
            options,
            MessageDescriptor::default(),
            Arc::new(handler_fn(|_| {})),
            1024,
            Instant::now(),
        ));
        key
    }

    fn release_all(registry: &mut Registry) {
        let keys: Vec<(ContextKey, u64)> = registry
            .list_for_connection(CONN)
            .iter()
            .map(|ctx| (ctx.key, ctx.generation))
            .collect();
        for (key, generation) in keys {
            registry.current_mut(&key, generation).unwrap().release();
        }
    }

    #[test]
    fn test_abandon_without_contexts() {
        let picker = FairnessPicker::seeded(1);
        let mut registry = Registry::default();
        registry.activate(CONN);

        let decision = picker.decide(
            &mut registry,
            CONN,
            &Tuning::default(),
            &mut HashSet::new(),
            Instant::now(),
        );
        assert_eq!(decision, PassDecision::Abandon);
        assert_eq!(registry.active_connections(), 0);
    }

    #[test]
    fn test_productive_cycle_delays_once() {
        let picker = FairnessPicker::seeded(1);
        let mut registry = Registry::default();
        let key = add(&mut registry, 1, GetOptions::default());
        registry.record_retrieval(CONN);
        let tuning = Tuning::default();
        let mut swept = HashSet::new();

        let first = picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now());
        assert_eq!(first, PassDecision::Delay(tuning.inter_cycle_delay));

        let second = picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now());
        assert!(matches!(second, PassDecision::Dispatch { key: k, .. } if k == key));
    }

    #[test]
    fn test_dispatch_marks_context_and_excludes_it() {
        let picker = FairnessPicker::seeded(1);
        let mut registry = Registry::default();
        add(&mut registry, 1, GetOptions::waiting(WaitInterval::Unlimited));
        let tuning = Tuning::default();
        let mut swept = HashSet::new();

        let first = picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now());
        assert!(matches!(first, PassDecision::Dispatch { .. }));

        // The only context is mid-dispatch, nothing else to do
        let second = picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now());
        assert_eq!(second, PassDecision::Delay(tuning.idle_poll_interval));
    }

    #[test]
    fn test_sweep_rests_after_every_context_was_empty() {
        let picker = FairnessPicker::seeded(7);
        let mut registry = Registry::default();
        add(&mut registry, 1, GetOptions::waiting(WaitInterval::Unlimited));
        add(&mut registry, 2, GetOptions::waiting(WaitInterval::Unlimited));
        let tuning = Tuning::default();
        let mut swept = HashSet::new();

        for _ in 0..2 {
            match picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now()) {
                PassDecision::Dispatch { key, .. } => {
                    assert!(swept.insert(key.object), "picked an already swept object");
                }
                other => panic!("expected dispatch, got {:?}", other),
            }
            release_all(&mut registry);
        }

        let rest = picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now());
        assert_eq!(rest, PassDecision::Delay(tuning.idle_poll_interval));
        assert!(swept.is_empty());
    }

    #[test]
    fn test_rest_clamped_to_nearest_deadline() {
        let picker = FairnessPicker::seeded(3);
        let mut registry = Registry::default();
        let key = add(&mut registry, 1, GetOptions::waiting(WaitInterval::Millis(2000)));
        let tuning = Tuning::default();
        let mut swept = HashSet::from([key.object]);

        let now = Instant::now();
        match picker.decide(&mut registry, CONN, &tuning, &mut swept, now) {
            PassDecision::Delay(delay) => assert!(delay <= Duration::from_millis(2000)),
            other => panic!("expected delay, got {:?}", other),
        }
    }

    #[test]
    fn test_every_context_gets_picked() {
        let picker = FairnessPicker::seeded(42);
        let mut registry = Registry::default();
        for object in 1..=4 {
            add(&mut registry, object, GetOptions::waiting(WaitInterval::Unlimited));
        }
        let tuning = Tuning::default();
        let mut counts: HashMap<ObjectHandle, usize> = HashMap::new();

        for _ in 0..4000 {
            // Messages always available: nothing is ever swept
            let mut swept = HashSet::new();
            if let PassDecision::Dispatch { key, .. } =
                picker.decide(&mut registry, CONN, &tuning, &mut swept, Instant::now())
            {
                *counts.entry(key.object).or_default() += 1;
            }
            release_all(&mut registry);
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            // Expected 1000 each
            assert!(*count > 800, "unfair selection: {:?}", counts);
        }
    }
}
