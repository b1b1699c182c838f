//! mqpoll Client
//!
//! Message-arrival callbacks over a transport that can only receive one
//! message at a time, synchronously.
//!
//! Applications register a handler per opened object; the [`Scheduler`]
//! polls every registration with non-blocking retrieval attempts, fairly
//! across objects and connections, and calls the handler with each message
//! or once with a terminal error. No caller-side loop is needed.
//!
//! The scheduler trades CPU for portability: it never relies on push
//! notifications from the transport. Delays are tuned through
//! [`Tuning`](mqpoll_core::domain::tuning::Tuning).

pub mod error;
mod handler;
mod scheduler;
pub mod transport;

// Re-export commonly used types
pub use error::{ClientError, Result, RetrievalError};
pub use handler::{Delivery, FnHandler, RetrievalHandler, handler_fn};
pub use scheduler::{GateGuard, Scheduler, SchedulerStats};
pub use transport::{MemoryTransport, Transport};
