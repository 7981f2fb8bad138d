//! Connection plumbing shared by server and client
//!
//! Each WebSocket is split in two. The read half stays with the task that
//! owns the connection; the write half moves into a writer task that drains
//! an `mpsc` channel, so any number of producers can queue frames without
//! locking the socket.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::TransportError;
use crate::types::ClientId;

/// Frames buffered per connection before producers wait
pub const OUTBOUND_BUFFER: usize = 64;

/// Spawn the task that owns the write half of a connection
///
/// Each write is bounded by `send_timeout`. The task stops after writing a
/// close frame, when a write fails, or when every sender is dropped, and
/// then closes the sink.
pub fn spawn_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Message>,
    send_timeout: Duration,
    id: ClientId,
) -> JoinHandle<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let closing = msg.is_close();
            match tokio::time::timeout(send_timeout, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%id, error = %e, "write failed, ending writer");
                    break;
                }
                Err(_) => {
                    debug!(%id, "write timed out after {:?}, ending writer", send_timeout);
                    break;
                }
            }
            if closing {
                break;
            }
        }
        let _ = tokio::time::timeout(send_timeout, sink.close()).await;
        debug!(%id, "writer ended");
    })
}

/// Lifecycle of an underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    None = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl TryFrom<u8> for LinkState {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LinkState::None),
            1 => Ok(LinkState::Connecting),
            2 => Ok(LinkState::Open),
            3 => Ok(LinkState::Closing),
            4 => Ok(LinkState::Closed),
            other => Err(TransportError::InvalidState(other)),
        }
    }
}

/// [`LinkState`] readable from any task
#[derive(Debug)]
pub struct AtomicLinkState(AtomicU8);

impl AtomicLinkState {
    pub fn new(state: LinkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> Result<LinkState, TransportError> {
        LinkState::try_from(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for AtomicLinkState {
    fn default() -> Self {
        Self::new(LinkState::None)
    }
}
