//! Retrieval contexts
//!
//! One context per (connection, object) with an outstanding registration.
//! Pure data and state transitions; the executor does the I/O.

use mqpoll_core::domain::handle::ContextKey;
use mqpoll_core::domain::message::{GetOptions, MessageDescriptor};
use mqpoll_core::domain::tuning::Tuning;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::handler::RetrievalHandler;

/// Whether a context can be picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Idle and eligible for the next pick
    Running,
    /// Picked; an attempt chain is in progress
    AwaitingDispatch,
}

/// Sizing limits for receive buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub min: usize,
    pub max: usize,
    pub shrink_percent: u8,
}

impl From<&Tuning> for BufferPolicy {
    fn from(tuning: &Tuning) -> Self {
        Self {
            min: tuning.min_buffer_size,
            max: tuning.max_buffer_size,
            shrink_percent: tuning.shrink_percent,
        }
    }
}

/// Receive buffer that grows on truncation and shrinks after under-use
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
}

impl ReceiveBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn filled(&self, length: usize) -> &[u8] {
        &self.data[..length.min(self.data.len())]
    }

    /// Doubles the capacity, capped at `policy.max`
    ///
    /// Returns false when the buffer is already at the cap.
    pub fn grow(&mut self, policy: &BufferPolicy) -> bool {
        let current = self.capacity();
        if current >= policy.max {
            return false;
        }
        let next = current.saturating_mul(2).clamp(policy.min, policy.max);
        self.data.resize(next, 0);
        true
    }

    /// Shrinks after a message that used less than the shrink share
    ///
    /// Never goes below `policy.min`.
    pub fn shrink_after(&mut self, used: usize, policy: &BufferPolicy) {
        let current = self.capacity();
        if current <= policy.min {
            return;
        }
        let target = (current as u64 * policy.shrink_percent as u64 / 100) as usize;
        if used < target {
            self.data.truncate(target.max(policy.min));
            self.data.shrink_to_fit();
        }
    }
}

/// Everything an attempt needs while the context itself stays in the registry
pub(crate) struct Flight {
    pub key: ContextKey,
    pub generation: u64,
    pub handler: Arc<dyn RetrievalHandler>,
    pub options: GetOptions,
    pub descriptor: MessageDescriptor,
    pub buffer: ReceiveBuffer,
    pub wait_started: Instant,
    pub wait_budget: Option<Duration>,
}

impl Flight {
    /// Time left before the wait budget runs out; `None` means unlimited
    pub fn remaining_wait(&self, now: Instant) -> Option<Duration> {
        remaining(self.wait_started, self.wait_budget, now)
    }

    pub fn wait_expired(&self, now: Instant) -> bool {
        self.remaining_wait(now).is_some_and(|left| left.is_zero())
    }
}

/// An outstanding registration
pub(crate) struct RetrievalContext {
    pub key: ContextKey,
    /// Distinguishes a replacement registered under the same key
    pub generation: u64,
    pub handler: Arc<dyn RetrievalHandler>,
    pub options: GetOptions,
    pub descriptor: MessageDescriptor,
    buffer: ReceiveBuffer,
    pub wait_started: Instant,
    pub wait_budget: Option<Duration>,
    pub state: ContextState,
    pub retrieved_this_cycle: u32,
}

impl RetrievalContext {
    pub fn new(
        key: ContextKey,
        generation: u64,
        options: GetOptions,
        descriptor: MessageDescriptor,
        handler: Arc<dyn RetrievalHandler>,
        initial_buffer: usize,
        now: Instant,
    ) -> Self {
        let wait_budget = options.wait_budget();
        Self {
            key,
            generation,
            handler,
            options,
            descriptor,
            buffer: ReceiveBuffer::with_capacity(initial_buffer),
            wait_started: now,
            wait_budget,
            state: ContextState::Running,
            retrieved_this_cycle: 0,
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn remaining_wait(&self, now: Instant) -> Option<Duration> {
        remaining(self.wait_started, self.wait_budget, now)
    }

    /// Marks the context picked and starts a fresh drain count
    pub fn dispatch(&mut self) {
        self.state = ContextState::AwaitingDispatch;
        self.retrieved_this_cycle = 0;
    }

    /// Lends the working state to an attempt
    ///
    /// Templates are cloned; the buffer moves out until [`check_in`](Self::check_in).
    pub fn check_out(&mut self) -> Flight {
        Flight {
            key: self.key,
            generation: self.generation,
            handler: Arc::clone(&self.handler),
            options: self.options.clone(),
            descriptor: self.descriptor.clone(),
            buffer: std::mem::take(&mut self.buffer),
            wait_started: self.wait_started,
            wait_budget: self.wait_budget,
        }
    }

    /// Returns the buffer after an attempt that delivered nothing
    pub fn check_in(&mut self, buffer: ReceiveBuffer) {
        self.buffer = buffer;
    }

    /// Records a delivered message and restarts the wait clock
    ///
    /// `options` are the handler's (possibly changed) options; they become
    /// the template for later attempts. Returns the drain count so far.
    pub fn delivered(
        &mut self,
        mut buffer: ReceiveBuffer,
        used: usize,
        options: GetOptions,
        policy: &BufferPolicy,
        now: Instant,
    ) -> u32 {
        buffer.shrink_after(used, policy);
        self.buffer = buffer;
        self.wait_budget = options.wait_budget();
        self.options = options;
        self.wait_started = now;
        self.retrieved_this_cycle += 1;
        self.retrieved_this_cycle
    }

    /// Makes the context eligible for picking again
    pub fn release(&mut self) {
        self.state = ContextState::Running;
    }
}

fn remaining(started: Instant, budget: Option<Duration>, now: Instant) -> Option<Duration> {
    budget.map(|budget| budget.saturating_sub(now.saturating_duration_since(started)))
}
