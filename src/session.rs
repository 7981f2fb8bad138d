//! Server-side session
//!
//! Binds a correlation id to the live connection: the outbound channel
//! feeding the connection's writer task, the token that stops its read
//! loop, and the last time anything was heard from the peer.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::types::ClientId;

/// One live connection as seen by the session manager
#[derive(Debug)]
pub struct Session {
    /// Correlation id of the connected client
    pub id: ClientId,
    /// Frames for the connection's writer task
    outbound: mpsc::Sender<Message>,
    /// Cancelling stops the connection's read loop
    closer: CancellationToken,
    /// Last liveness signal
    last_seen: Mutex<Instant>,
    /// Upper bound on handing a frame to the writer
    send_timeout: Duration,
}

impl Session {
    pub fn new(
        id: ClientId,
        outbound: mpsc::Sender<Message>,
        closer: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id,
            outbound,
            closer,
            last_seen: Mutex::new(Instant::now()),
            send_timeout,
        }
    }

    /// Record a liveness signal
    pub fn keep_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last liveness signal
    pub fn inactivity_period(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue a frame for the connection's writer
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        match self.outbound.send_timeout(msg, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(TransportError::SendTimeout(self.send_timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }

    /// Stop the read loop and ask the writer to send a close frame
    ///
    /// Best-effort: a writer that is already gone or backed up is ignored.
    pub fn close(&self) {
        self.closer.cancel();
        let _ = self.outbound.try_send(Message::Close(None));
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.outbound.is_closed()
    }
}
