//! In-memory transport
//!
//! A single-process stand-in for a queue manager. Queues are shared by name
//! across connections. Used by the integration tests and the CLI demo.
//!
//! Retrieval never waits and never consumes a message that does not fit the
//! supplied buffer. Syncpoint control is not modelled.

use async_trait::async_trait;
use bytes::Bytes;
use mqpoll_core::domain::connection::ConnectOptions;
use mqpoll_core::domain::handle::{ConnectionHandle, ObjectHandle};
use mqpoll_core::domain::message::{GetOptions, MessageDescriptor};
use mqpoll_core::domain::outcome::{ConnectionState, GetOutcome, ReasonCode, TransportError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::Transport;

#[derive(Debug)]
struct Connection {
    options: ConnectOptions,
    state: ConnectionState,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Debug)]
struct OpenObject {
    connection: ConnectionHandle,
    queue: String,
    buffer_sizes: Vec<usize>,
    injected: VecDeque<TransportError>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    descriptor: MessageDescriptor,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    next_message_id: u64,
    connections: HashMap<ConnectionHandle, Connection>,
    objects: HashMap<ObjectHandle, OpenObject>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    calls: u64,
}

impl State {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn usable_connection(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        match self.connections.get(&connection).map(|c| c.state) {
            Some(ConnectionState::Healthy) => Ok(()),
            Some(ConnectionState::Interrupted) => Err(TransportError::new(
                ReasonCode::ConnectionBroken,
                "connection interrupted",
            )),
            Some(ConnectionState::Closed) | None => Err(TransportError::new(
                ReasonCode::HandleInvalid,
                format!("unknown connection {}", connection),
            )),
        }
    }

    fn object_on(
        &mut self,
        connection: ConnectionHandle,
        object: ObjectHandle,
    ) -> Result<&mut OpenObject, TransportError> {
        match self.objects.get_mut(&object) {
            Some(open) if open.connection == connection => Ok(open),
            _ => Err(TransportError::new(
                ReasonCode::ObjectHandleInvalid,
                format!("{} is not open on {}", object, connection),
            )),
        }
    }
}

/// In-memory transport
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

/// Decrements the in-flight count even if the call future is dropped
struct InFlight<'a> {
    transport: &'a MemoryTransport,
    connection: ConnectionHandle,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.transport.state.lock();
        if let Some(conn) = state.connections.get_mut(&self.connection) {
            conn.in_flight = conn.in_flight.saturating_sub(1);
        }
    }
}

impl MemoryTransport {
    /// Creates an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every retrieval take `latency` instead of a single yield
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Opens a connection
    pub fn connect(&self, options: ConnectOptions) -> ConnectionHandle {
        let mut state = self.state.lock();
        let handle = ConnectionHandle(state.allocate());
        debug!("Connected {} with {:?}", handle, options.flags);
        state.connections.insert(
            handle,
            Connection {
                options,
                state: ConnectionState::Healthy,
                in_flight: 0,
                max_in_flight: 0,
            },
        );
        handle
    }

    /// Options a connection was opened with
    pub fn connect_options(&self, connection: ConnectionHandle) -> Option<ConnectOptions> {
        self.state
            .lock()
            .connections
            .get(&connection)
            .map(|c| c.options.clone())
    }

    /// Closes a connection and every object opened under it
    pub fn disconnect(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match state.connections.get_mut(&connection) {
            Some(conn) if conn.state != ConnectionState::Closed => {
                conn.state = ConnectionState::Closed;
            }
            _ => {
                return Err(TransportError::new(
                    ReasonCode::HandleInvalid,
                    format!("unknown connection {}", connection),
                ));
            }
        }
        state.objects.retain(|_, open| open.connection != connection);
        Ok(())
    }

    /// Marks a connection interrupted, or healthy again
    pub fn interrupt(&self, connection: ConnectionHandle, interrupted: bool) {
        let mut state = self.state.lock();
        if let Some(conn) = state.connections.get_mut(&connection) {
            if conn.state != ConnectionState::Closed {
                conn.state = if interrupted {
                    ConnectionState::Interrupted
                } else {
                    ConnectionState::Healthy
                };
            }
        }
    }

    /// Opens a queue, creating it if needed
    pub fn open(
        &self,
        connection: ConnectionHandle,
        queue: &str,
    ) -> Result<ObjectHandle, TransportError> {
        let mut state = self.state.lock();
        state.usable_connection(connection)?;

        let handle = ObjectHandle(state.allocate());
        state.queues.entry(queue.to_string()).or_default();
        state.objects.insert(
            handle,
            OpenObject {
                connection,
                queue: queue.to_string(),
                buffer_sizes: Vec::new(),
                injected: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    /// Closes an object
    pub fn close(
        &self,
        connection: ConnectionHandle,
        object: ObjectHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.object_on(connection, object)?;
        state.objects.remove(&object);
        Ok(())
    }

    /// Puts a message on the queue behind `object`
    ///
    /// An empty message id is replaced by a generated one.
    pub fn put(
        &self,
        connection: ConnectionHandle,
        object: ObjectHandle,
        mut descriptor: MessageDescriptor,
        payload: impl Into<Bytes>,
    ) -> Result<MessageDescriptor, TransportError> {
        let mut state = self.state.lock();
        state.usable_connection(connection)?;
        let queue = state.object_on(connection, object)?.queue.clone();

        if descriptor.message_id.is_empty() {
            state.next_message_id += 1;
            let mut id = vec![0u8; 24];
            id[16..].copy_from_slice(&state.next_message_id.to_be_bytes());
            descriptor.message_id = id;
        }
        descriptor.put_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        state
            .queues
            .entry(queue)
            .or_default()
            .push_back(StoredMessage {
                descriptor: descriptor.clone(),
                payload: payload.into(),
            });
        Ok(descriptor)
    }

    /// Makes the next retrieval on `object` fail with `error`
    pub fn fail_next(&self, object: ObjectHandle, error: TransportError) {
        if let Some(open) = self.state.lock().objects.get_mut(&object) {
            open.injected.push_back(error);
        }
    }

    /// Messages currently on a queue
    pub fn depth(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Total number of retrieval calls made
    pub fn calls(&self) -> u64 {
        self.state.lock().calls
    }

    /// Highest number of simultaneous calls seen on a connection
    pub fn max_in_flight(&self, connection: ConnectionHandle) -> usize {
        self.state
            .lock()
            .connections
            .get(&connection)
            .map_or(0, |c| c.max_in_flight)
    }

    /// Buffer sizes offered to each retrieval on `object`, oldest first
    pub fn buffer_sizes(&self, object: ObjectHandle) -> Vec<usize> {
        self.state
            .lock()
            .objects
            .get(&object)
            .map(|open| open.buffer_sizes.clone())
            .unwrap_or_default()
    }

    fn enter(&self, connection: ConnectionHandle) -> InFlight<'_> {
        let mut state = self.state.lock();
        state.calls += 1;
        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.in_flight += 1;
            conn.max_in_flight = conn.max_in_flight.max(conn.in_flight);
        }
        InFlight {
            transport: self,
            connection,
        }
    }

    fn complete(
        &self,
        connection: ConnectionHandle,
        object: ObjectHandle,
        descriptor: &mut MessageDescriptor,
        options: &GetOptions,
        buffer: &mut [u8],
    ) -> Result<GetOutcome, TransportError> {
        let mut state = self.state.lock();
        state.usable_connection(connection)?;

        let open = state.object_on(connection, object)?;
        open.buffer_sizes.push(buffer.len());
        if let Some(err) = open.injected.pop_front() {
            return Err(err);
        }
        let queue_name = open.queue.clone();

        let Some(queue) = state.queues.get_mut(&queue_name) else {
            return Ok(GetOutcome::NoData);
        };
        let Some(index) = queue
            .iter()
            .position(|m| descriptor.matches(&m.descriptor, options.match_options))
        else {
            return Ok(GetOutcome::NoData);
        };

        let data_length = queue[index].payload.len();
        if data_length > buffer.len() {
            return Ok(GetOutcome::Truncated { data_length });
        }

        if let Some(message) = queue.remove(index) {
            buffer[..data_length].copy_from_slice(&message.payload);
            *descriptor = message.descriptor;
        }
        Ok(GetOutcome::Message { data_length })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get(
        &self,
        connection: ConnectionHandle,
        object: ObjectHandle,
        descriptor: &mut MessageDescriptor,
        options: &GetOptions,
        buffer: &mut [u8],
    ) -> GetOutcome {
        let _in_flight = self.enter(connection);

        let latency = *self.latency.lock();
        match latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }

        self.complete(connection, object, descriptor, options, buffer)
            .unwrap_or_else(GetOutcome::Failed)
    }

    fn connection_state(&self, connection: ConnectionHandle) -> ConnectionState {
        self.state
            .lock()
            .connections
            .get(&connection)
            .map_or(ConnectionState::Closed, |c| c.state)
    }
}
