//! Connection gate
//!
//! The transport is not reentrant per connection handle, so every call on a
//! handle goes through this gate. Waiting for it is an `.await`, never a
//! blocked thread.

use mqpoll_core::domain::handle::ConnectionHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

type HeldSince = Arc<Mutex<HashMap<ConnectionHandle, Instant>>>;

/// Per-connection mutual exclusion
#[derive(Default)]
pub struct ConnectionGate {
    locks: Mutex<HashMap<ConnectionHandle, Arc<AsyncMutex<()>>>>,
    /// When each current holder acquired its gate, for diagnosing stuck calls
    held: HeldSince,
}

/// Proof of holding a connection's gate; dropping it leaves the gate
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard {
    connection: ConnectionHandle,
    held: HeldSince,
    _permit: OwnedMutexGuard<()>,
}

impl GateGuard {
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// Leaves the gate
    pub fn leave(self) {}
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.connection);
    }
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, connection: ConnectionHandle) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(connection).or_default())
    }

    fn guard(&self, connection: ConnectionHandle, permit: OwnedMutexGuard<()>) -> GateGuard {
        self.held.lock().insert(connection, Instant::now());
        GateGuard {
            connection,
            held: Arc::clone(&self.held),
            _permit: permit,
        }
    }

    /// Enters the gate if nobody holds it
    pub fn try_enter(&self, connection: ConnectionHandle) -> Option<GateGuard> {
        let permit = self.lock_for(connection).try_lock_owned().ok()?;
        Some(self.guard(connection, permit))
    }

    /// Enters the gate, waiting for the current holder to leave
    pub async fn enter(&self, connection: ConnectionHandle) -> GateGuard {
        if let Some(guard) = self.try_enter(connection) {
            return guard;
        }

        debug!("Gate for {} busy, deferring", connection);
        let permit = self.lock_for(connection).lock_owned().await;
        self.guard(connection, permit)
    }

    /// How long the current holder has held a connection's gate
    pub fn held_for(&self, connection: ConnectionHandle) -> Option<Duration> {
        self.held
            .lock()
            .get(&connection)
            .map(|since| since.elapsed())
    }

    /// Gates held for longer than `threshold`
    pub fn stuck(&self, threshold: Duration) -> Vec<(ConnectionHandle, Duration)> {
        let mut stuck: Vec<_> = self
            .held
            .lock()
            .iter()
            .map(|(conn, since)| (*conn, since.elapsed()))
            .filter(|(_, held)| *held > threshold)
            .collect();
        stuck.sort();
        stuck
    }

    /// Drops a connection's gate once nobody holds or waits for it
    pub fn forget(&self, connection: ConnectionHandle) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(&connection) {
            if Arc::strong_count(lock) == 1 && lock.try_lock().is_ok() {
                locks.remove(&connection);
            }
        }
    }

    /// Number of connections with a gate
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_enter_excludes() {
        let gate = ConnectionGate::new();
        let conn = ConnectionHandle(1);

        let guard = gate.try_enter(conn).unwrap();
        assert!(gate.try_enter(conn).is_none());
        assert!(gate.try_enter(ConnectionHandle(2)).is_some());

        guard.leave();
        assert!(gate.try_enter(conn).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_waits_for_holder() {
        let gate = Arc::new(ConnectionGate::new());
        let conn = ConnectionHandle(7);
        let guard = gate.enter(conn).await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let guard = gate.enter(conn).await;
                guard.connection()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.held_for(conn), Some(Duration::from_millis(50)));

        drop(guard);
        assert_eq!(waiter.await.unwrap(), conn);
        assert_eq!(gate.held_for(conn), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_reports_long_holders() {
        let gate = ConnectionGate::new();
        let _a = gate.enter(ConnectionHandle(1)).await;
        tokio::time::sleep(Duration::from_secs(40)).await;
        let _b = gate.enter(ConnectionHandle(2)).await;

        let stuck = gate.stuck(Duration::from_secs(30));
        assert_eq!(stuck, vec![(ConnectionHandle(1), Duration::from_secs(40))]);
    }

    #[test]
    fn test_forget_keeps_held_gate() {
        let gate = ConnectionGate::new();
        let guard = gate.try_enter(ConnectionHandle(1)).unwrap();
        gate.forget(ConnectionHandle(1));
        assert!(gate.try_enter(ConnectionHandle(1)).is_none());
        drop(guard);

        gate.forget(ConnectionHandle(1));
        assert!(gate.locks.lock().is_empty());
    }
}
