//! UDP listener
//!
//! Receives datagrams on a background task and fans each one out to every
//! subscriber.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Largest payload a single UDP datagram can carry
const MAX_DATAGRAM: usize = 65_535;

/// Subscriber buffer before lagging
const DATAGRAM_CAPACITY: usize = 1024;

/// Pause after a transient receive error
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Background UDP receive loop
#[derive(Debug)]
pub struct UdpListener {
    local_addr: SocketAddr,
    datagrams: broadcast::Sender<Datagram>,
    stop: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpListener {
    /// Bind to `addr` and start receiving
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (datagrams, _) = broadcast::channel(DATAGRAM_CAPACITY);
        let stop = CancellationToken::new();

        let receiver = tokio::spawn(receive_loop(socket, datagrams.clone(), stop.clone()));
        info!("UDP listener on {}", local_addr);

        Ok(Self {
            local_addr,
            datagrams,
            stop,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Receive every datagram that arrives from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Datagram> {
        self.datagrams.subscribe()
    }

    /// Stop the receive loop and release the socket
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    datagrams: broadcast::Sender<Datagram>,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, from)) => {
                let _ = datagrams.send(Datagram {
                    from,
                    bytes: buf[..len].to_vec(),
                });
            }
            Err(e) => match retry_after(&e) {
                Some(pause) => {
                    warn!("UDP receive failed: {}", e);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                None => {
                    warn!("UDP receive failed permanently, stopping: {}", e);
                    break;
                }
            },
        }
    }
    debug!("UDP receive loop ended");
}

/// Backoff before the next receive, or `None` when the socket is unusable
fn retry_after(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        // ICMP port unreachable surfaces as a reset on some platforms
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => Some(RECEIVE_ERROR_BACKOFF),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_receives_datagrams() {
        let listener = UdpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut datagrams = listener.subscribe();
        assert_ne!(listener.port(), 0);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello", listener.local_addr()).await.unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(2), datagrams.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.bytes, b"hello");
        assert_eq!(datagram.from, sender.local_addr().unwrap());

        listener.shutdown().await;
    }

    #[test]
    fn test_receive_errors_back_off_or_stop() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(retry_after(&reset), Some(RECEIVE_ERROR_BACKOFF));
        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(retry_after(&interrupted), Some(RECEIVE_ERROR_BACKOFF));

        let bad_fd = io::Error::from(io::ErrorKind::InvalidInput);
        assert_eq!(retry_after(&bad_fd), None);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(retry_after(&denied), None);
    }
}
