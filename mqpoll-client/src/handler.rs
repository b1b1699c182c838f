//! Retrieval handlers
//!
//! A handler is the only way results leave the scheduler: it is called once
//! per delivered message and at most once with a terminal error.

use bytes::Bytes;
use mqpoll_core::domain::handle::{ConnectionHandle, ObjectHandle};
use mqpoll_core::domain::message::{GetOptions, MessageDescriptor};

use crate::error::RetrievalError;

/// One delivered message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub connection: ConnectionHandle,
    pub object: ObjectHandle,
    /// The registration's get-options. Changes made here apply to every
    /// later retrieval for this registration, including its wait budget.
    pub options: GetOptions,
    /// Descriptor of the delivered message as filled in by the transport
    pub descriptor: MessageDescriptor,
    pub payload: Bytes,
}

/// Receives the results of a registered retrieval
pub trait RetrievalHandler: Send + Sync + 'static {
    /// Called with each message, or once with the terminal error
    fn handle(&self, result: Result<&mut Delivery, RetrievalError>);
}

/// Adapter turning a closure into a [`RetrievalHandler`]
pub struct FnHandler<F>(F);

/// Wraps a closure as a handler
///
/// # Example
/// ```
/// use mqpoll_client::handler_fn;
///
/// let handler = handler_fn(|result| match result {
///     Ok(delivery) => println!("{} bytes", delivery.payload.len()),
///     Err(e) => eprintln!("retrieval ended: {}", e),
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Result<&mut Delivery, RetrievalError>) + Send + Sync + 'static,
{
    FnHandler(f)
}

impl<F> RetrievalHandler for FnHandler<F>
where
    F: Fn(Result<&mut Delivery, RetrievalError>) + Send + Sync + 'static,
{
    fn handle(&self, result: Result<&mut Delivery, RetrievalError>) {
        (self.0)(result)
    }
}
