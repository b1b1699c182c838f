//! Connection and object handles

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for one transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

/// Opaque identifier for one opened queue, topic or subscription
///
/// Only meaningful under the connection it was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

/// Key of a registered retrieval: at most one context exists per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub connection: ConnectionHandle,
    pub object: ObjectHandle,
}

impl ContextKey {
    pub fn new(connection: ConnectionHandle, object: ObjectHandle) -> Self {
        Self { connection, object }
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hconn:{}", self.0)
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hobj:{}", self.0)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_key_display() {
        let key = ContextKey::new(ConnectionHandle(3), ObjectHandle(17));
        assert_eq!(key.to_string(), "hconn:3/hobj:17");
    }

    #[test]
    fn test_context_key_ordering_groups_by_connection() {
        let mut keys = vec![
            ContextKey::new(ConnectionHandle(2), ObjectHandle(1)),
            ContextKey::new(ConnectionHandle(1), ObjectHandle(9)),
            ContextKey::new(ConnectionHandle(1), ObjectHandle(2)),
        ];
        keys.sort();
        assert_eq!(keys[0].connection, ConnectionHandle(1));
        assert_eq!(keys[0].object, ObjectHandle(2));
        assert_eq!(keys[2].connection, ConnectionHandle(2));
    }
}
