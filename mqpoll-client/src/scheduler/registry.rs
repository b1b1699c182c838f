//! Context registry
//!
//! The scheduler's only shared mutable state: registered contexts, the set
//! of connections under active polling, and per-connection retrieval
//! counters. Always accessed under one short lock, never across an await.

use mqpoll_core::domain::handle::{ConnectionHandle, ContextKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Instant;

use super::context::{ContextState, RetrievalContext};

#[derive(Default)]
pub(crate) struct Registry {
    contexts: BTreeMap<ContextKey, RetrievalContext>,
    active: BTreeSet<ConnectionHandle>,
    retrieved: HashMap<ConnectionHandle, u64>,
    next_generation: u64,
    /// Whether the top-level loop is alive
    pub driver_running: bool,
}

impl Registry {
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Inserts a context, returning the one it replaced
    pub fn insert(&mut self, context: RetrievalContext) -> Option<RetrievalContext> {
        self.contexts.insert(context.key, context)
    }

    pub fn remove(&mut self, key: &ContextKey) -> Option<RetrievalContext> {
        self.contexts.remove(key)
    }

    /// Removes a context only if it is still the given registration
    pub fn remove_if_current(&mut self, key: &ContextKey, generation: u64) -> Option<RetrievalContext> {
        match self.contexts.get(key) {
            Some(ctx) if ctx.generation == generation => self.contexts.remove(key),
            _ => None,
        }
    }

    /// Looks up a context only if it is still the given registration
    pub fn current_mut(&mut self, key: &ContextKey, generation: u64) -> Option<&mut RetrievalContext> {
        self.contexts
            .get_mut(key)
            .filter(|ctx| ctx.generation == generation)
    }

    pub fn get(&self, key: &ContextKey) -> Option<&RetrievalContext> {
        self.contexts.get(key)
    }

    /// Removes every context, keeping the polling bookkeeping
    pub fn clear(&mut self) -> usize {
        let count = self.contexts.len();
        self.contexts.clear();
        self.retrieved.clear();
        count
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.contexts.contains_key(key)
    }

    /// Removes every context on a connection
    pub fn remove_connection(&mut self, connection: ConnectionHandle) -> Vec<RetrievalContext> {
        let keys: Vec<ContextKey> = self
            .contexts
            .keys()
            .filter(|key| key.connection == connection)
            .copied()
            .collect();
        self.retrieved.remove(&connection);
        keys.iter()
            .filter_map(|key| self.contexts.remove(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// All contexts registered on a connection
    pub fn list_for_connection(&self, connection: ConnectionHandle) -> Vec<&RetrievalContext> {
        self.contexts
            .range(connection_range(connection))
            .map(|(_, ctx)| ctx)
            .collect()
    }

    /// The subset that is idle and eligible for a pick
    pub fn list_running<'a>(contexts: &[&'a RetrievalContext]) -> Vec<&'a RetrievalContext> {
        contexts
            .iter()
            .filter(|ctx| ctx.state == ContextState::Running)
            .copied()
            .collect()
    }

    pub fn has_connection(&self, connection: ConnectionHandle) -> bool {
        self.contexts
            .range(connection_range(connection))
            .next()
            .is_some()
    }

    /// Connections with contexts that nobody is polling yet
    pub fn undiscovered(&self) -> Vec<ConnectionHandle> {
        let mut found: Vec<ConnectionHandle> = self
            .contexts
            .keys()
            .map(|key| key.connection)
            .filter(|conn| !self.active.contains(conn))
            .collect();
        found.dedup();
        found
    }

    pub fn activate(&mut self, connection: ConnectionHandle) -> bool {
        self.active.insert(connection)
    }

    pub fn deactivate(&mut self, connection: ConnectionHandle) {
        self.active.remove(&connection);
        self.retrieved.remove(&connection);
    }

    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    /// Counts a message retrieved on a connection in the current cycle
    pub fn record_retrieval(&mut self, connection: ConnectionHandle) {
        *self.retrieved.entry(connection).or_default() += 1;
    }

    /// Returns and resets the connection's retrieval count
    pub fn take_retrieved(&mut self, connection: ConnectionHandle) -> u64 {
        self.retrieved.remove(&connection).unwrap_or(0)
    }

    /// Earliest remaining wait among the running contexts on a connection
    pub fn earliest_deadline(&self, connection: ConnectionHandle, now: Instant) -> Option<std::time::Duration> {
        self.contexts
            .range(connection_range(connection))
            .filter(|(_, ctx)| ctx.state == ContextState::Running)
            .filter_map(|(_, ctx)| ctx.remaining_wait(now))
            .min()
    }
}

fn connection_range(connection: ConnectionHandle) -> std::ops::RangeInclusive<ContextKey> {
    use mqpoll_core::domain::handle::ObjectHandle;

    ContextKey::new(connection, ObjectHandle(u64::MIN))..=ContextKey::new(connection, ObjectHandle(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use mqpoll_core::domain::handle::ObjectHandle;
    use mqpoll_core::domain::message::{GetOptions, MessageDescriptor, WaitInterval};
    use std::sync::Arc;
    use std::time::Duration;

    fn key(conn: u64, obj: u64) -> ContextKey {
        ContextKey::new(ConnectionHandle(conn), ObjectHandle(obj))
    }

    fn add(registry: &mut Registry, key: ContextKey, options: GetOptions) -> u64 {
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
        generation
    }

    #[test]
    fn test_register_replaces_same_key() {
        let mut registry = Registry::default();
        let first = add(&mut registry, key(1, 1), GetOptions::default());
        let second = add(&mut registry, key(1, 1), GetOptions::default());

        assert_eq!(registry.len(), 1);
        assert!(registry.current_mut(&key(1, 1), first).is_none());
        assert!(registry.current_mut(&key(1, 1), second).is_some());
        assert!(registry.remove_if_current(&key(1, 1), first).is_none());
        assert!(registry.remove_if_current(&key(1, 1), second).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_for_connection_and_running() {
        let mut registry = Registry::default();
        add(&mut registry, key(1, 1), GetOptions::default());
        let g = add(&mut registry, key(1, 2), GetOptions::default());
        add(&mut registry, key(2, 1), GetOptions::default());

        registry.current_mut(&key(1, 2), g).unwrap().dispatch();

        let on_one = registry.list_for_connection(ConnectionHandle(1));
        assert_eq!(on_one.len(), 2);
        let running = Registry::list_running(&on_one);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].key, key(1, 1));
    }

    #[test]
    fn test_undiscovered_connections() {
        let mut registry = Registry::default();
        add(&mut registry, key(1, 1), GetOptions::default());
        add(&mut registry, key(1, 2), GetOptions::default());
        add(&mut registry, key(3, 1), GetOptions::default());

        assert_eq!(
            registry.undiscovered(),
            vec![ConnectionHandle(1), ConnectionHandle(3)]
        );
        assert!(registry.activate(ConnectionHandle(1)));
        assert!(!registry.activate(ConnectionHandle(1)));
        assert_eq!(registry.undiscovered(), vec![ConnectionHandle(3)]);
    }

    #[test]
    fn test_remove_connection_cascades() {
        let mut registry = Registry::default();
        add(&mut registry, key(1, 1), GetOptions::default());
        add(&mut registry, key(1, 2), GetOptions::default());
        add(&mut registry, key(2, 1), GetOptions::default());
        registry.record_retrieval(ConnectionHandle(1));

        let removed = registry.remove_connection(ConnectionHandle(1));
        assert_eq!(removed.len(), 2);
        assert!(!registry.has_connection(ConnectionHandle(1)));
        assert!(registry.has_connection(ConnectionHandle(2)));
        assert_eq!(registry.take_retrieved(ConnectionHandle(1)), 0);
    }

    #[test]
    fn test_retrieval_counter_resets() {
        let mut registry = Registry::default();
        registry.record_retrieval(ConnectionHandle(4));
        registry.record_retrieval(ConnectionHandle(4));
        assert_eq!(registry.take_retrieved(ConnectionHandle(4)), 2);
        assert_eq!(registry.take_retrieved(ConnectionHandle(4)), 0);
    }

    #[test]
    fn test_earliest_deadline_ignores_unlimited() {
        let mut registry = Registry::default();
        add(&mut registry, key(1, 1), GetOptions::waiting(WaitInterval::Unlimited));
        assert_eq!(registry.earliest_deadline(ConnectionHandle(1), Instant::now()), None);

        add(&mut registry, key(1, 2), GetOptions::waiting(WaitInterval::Millis(2000)));
        add(&mut registry, key(1, 3), GetOptions::waiting(WaitInterval::Millis(5000)));
        let left = registry
            .earliest_deadline(ConnectionHandle(1), Instant::now())
            .unwrap();
        assert!(left <= Duration::from_millis(2000));
        assert!(left > Duration::from_millis(1000));
    }
}
