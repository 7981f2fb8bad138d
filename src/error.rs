//! Error types for the transport
//!
//! Defines transport-level errors, work-queue admission errors and the
//! `ErrorSink` that background loops report into.
//! Uses thiserror for ergonomic error definitions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::error;

/// Transport errors
///
/// Covers construction-time validation, connection failures and the
/// failures of background units of work.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint rejected at construction
    #[error("The endpoint: {endpoint} is invalid, endpoint's scheme should be one of `ws` or `wss`")]
    InvalidEndpoint { endpoint: String },

    /// Configuration rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The object has been disposed
    #[error("{0} has been disposed.")]
    Disposed(&'static str),

    /// No open connection to write to
    #[error("Not connected")]
    NotConnected,

    /// Opening a connection failed
    #[error("{0}")]
    ConnectFailed(String),

    /// A stream yielded fewer bytes than announced
    #[error("The bytes read does not match length of data, read: {read} source: {expected}")]
    LengthMismatch { read: usize, expected: usize },

    /// The connection reported a state outside the known set
    #[error("Invalid connection state: {0}")]
    InvalidState(u8),

    /// A message of an unsupported kind arrived
    #[error("Invalid message type")]
    InvalidMessageType,

    /// The accept loop failed
    #[error("Exception when accepting clients: {0}")]
    Accept(#[source] std::io::Error),

    /// A unit of work panicked inside a queue worker
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    /// Work queue admission failure
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (the connection's writer is gone)
    #[error("Channel closed")]
    ChannelClosed,

    /// A write did not finish in time
    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),
}

/// Work queue admission errors
///
/// Ordinary backpressure and shutdown are reported, never panicked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue no longer accepts items
    #[error("Queue is closed")]
    Closed,

    /// The queue is at capacity
    #[error("Queue is full")]
    Full,

    /// No space freed up within the given time
    #[error("Timed out waiting for queue capacity")]
    Timeout,
}

type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Destination for errors raised where no caller can receive them
///
/// Always logs; forwards to the registered handler when there is one.
#[derive(Default)]
pub struct ErrorSink {
    handler: RwLock<Option<ErrorHandler>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the handler
    pub fn set<F>(&self, handler: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    pub fn report(&self, err: TransportError) {
        error!(error = %err, "transport error");
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(&err);
        }
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink")
            .field("has_handler", &self.handler.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_invalid_endpoint_message() {
        let err = TransportError::InvalidEndpoint {
            endpoint: "http://whatever.foo/bar".into(),
        };
        assert_eq!(
            err.to_string(),
            "The endpoint: http://whatever.foo/bar is invalid, endpoint's scheme should be one of `ws` or `wss`"
        );
    }

    #[test]
    fn test_sink_forwards_to_handler() {
        let sink = ErrorSink::new();
        sink.report(TransportError::NotConnected);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        sink.set(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sink.report(TransportError::NotConnected);
        sink.report(QueueError::Full.into());

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
