//! Transport layer
//!
//! The scheduler only needs two things from a transport: one non-blocking
//! retrieval attempt, and the health of a connection. Connect, open, close
//! and the other verbs belong to the transport itself.
//!
//! A transport is not reentrant per connection handle; the scheduler
//! guarantees at most one call per handle is in flight.

mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;
use mqpoll_core::domain::handle::{ConnectionHandle, ObjectHandle};
use mqpoll_core::domain::message::{GetOptions, MessageDescriptor};
use mqpoll_core::domain::outcome::{ConnectionState, GetOutcome};

/// Transport trait consumed by the scheduler
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempts to retrieve one message without waiting
    ///
    /// # Arguments
    /// * `descriptor` - Match template on entry, filled descriptor on success
    /// * `options` - Options for this call; never carries the wait flag
    /// * `buffer` - Receive buffer; its length is the capacity offered
    async fn get(
        &self,
        connection: ConnectionHandle,
        object: ObjectHandle,
        descriptor: &mut MessageDescriptor,
        options: &GetOptions,
        buffer: &mut [u8],
    ) -> GetOutcome;

    /// Reports whether a connection is usable
    fn connection_state(&self, connection: ConnectionHandle) -> ConnectionState;
}
