//! WebSocket client
//!
//! One outbound connection with an application-level heartbeat and optional
//! auto-reconnect. A driver task owns the connection attempts: it emits
//! `Connecting`, opens the socket, runs the read loop, emits `Disconnected`
//! and starts over when auto-reconnect is on.
//!
//! Every outbound write, heartbeat pings included, passes through a single
//! gate so a user send never interleaves with a ping.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::ClientConfig;
use crate::connection::{spawn_writer, AtomicLinkState, LinkState, OUTBOUND_BUFFER};
use crate::error::TransportError;
use crate::event::Event;
use crate::protocol;
use crate::server::EVENT_CAPACITY;
use crate::types::ClientId;

/// Observable client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient; only seen during an orderly close
    Closing,
}

impl From<LinkState> for ClientState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::None | LinkState::Closed => ClientState::Disconnected,
            LinkState::Connecting => ClientState::Connecting,
            LinkState::Open => ClientState::Connected,
            LinkState::Closing => ClientState::Closing,
        }
    }
}

/// Outcome of the current connection attempt; `None` while pending
type Outcome = Option<Result<(), String>>;

struct Inner {
    id: ClientId,
    endpoint: Url,
    protocol: HeaderValue,
    config: ClientConfig,
    link: AtomicLinkState,
    events: broadcast::Sender<Event>,
    disposed: AtomicBool,
    /// Cancelled on dispose; parent of every per-connection token
    shutdown: CancellationToken,
    /// Held for the duration of every outbound write
    gate: tokio::sync::Mutex<()>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: Event) {
        if self.is_disposed() {
            return;
        }
        let _ = self.events.send(event);
    }

    /// Write one frame while holding the gate
    async fn write(&self, msg: Message) -> Result<(), TransportError> {
        let _gate = self.gate.lock().await;
        if self.is_disposed() {
            return Err(TransportError::Disposed("Client"));
        }
        if self.link.load()? != LinkState::Open {
            return Err(TransportError::NotConnected);
        }
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        tx.send_timeout(msg, self.config.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    TransportError::SendTimeout(self.config.send_timeout)
                }
                mpsc::error::SendTimeoutError::Closed(_) => TransportError::ChannelClosed,
            })
    }

    async fn ping(&self) {
        if self.is_disposed() || !matches!(self.link.load(), Ok(LinkState::Open)) {
            return;
        }
        let ping = Message::Binary(protocol::PING.to_vec());
        if let Err(e) = self.write(ping).await {
            debug!(id = %self.id, "Heartbeat ping not sent: {}", e);
        }
    }

    async fn open(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, self.protocol.clone());

        match tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::ConnectFailed(format!(
                "Connection attempt timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Run an open connection until it ends
    ///
    /// Returns the close code and reason for the `Disconnected` event.
    async fn run(
        self: &Arc<Self>,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        outcome: &watch::Sender<Outcome>,
    ) -> (u16, Option<String>) {
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer = spawn_writer(sink, rx, self.config.send_timeout, self.id);
        *self.outbound.lock() = Some(tx);
        self.link.store(LinkState::Open);

        let link_closed = self.shutdown.child_token();
        let heartbeat = tokio::spawn(heartbeat(Arc::clone(self), link_closed.clone()));

        self.ping().await;
        info!(id = %self.id, "Connected to {}", self.endpoint);
        self.emit(Event::Connected { id: self.id });
        outcome.send_replace(Some(Ok(())));

        let close = loop {
            let next = tokio::select! {
                _ = link_closed.cancelled() => break (protocol::CLOSE_NORMAL, None),
                next = stream.next() => next,
            };
            match next {
                None => break (protocol::CONNECTION_REFUSED, None),
                Some(Err(e)) => {
                    debug!(id = %self.id, "Read failed: {}", e);
                    self.emit(Event::error(
                        self.id,
                        e.into(),
                        "Error while receiving from the connection",
                    ));
                    break (protocol::CONNECTION_REFUSED, None);
                }
                Some(Ok(Message::Text(text))) => self.emit(Event::text(self.id, text.to_string())),
                Some(Ok(Message::Binary(bytes))) if protocol::is_ping(&bytes) => {
                    if let Err(e) = self.write(Message::Binary(protocol::PONG.to_vec())).await {
                        debug!(id = %self.id, "Pong not sent: {}", e);
                    }
                }
                Some(Ok(Message::Binary(bytes))) if protocol::is_pong(&bytes) => {}
                Some(Ok(Message::Binary(bytes))) => self.emit(Event::binary(self.id, bytes.to_vec())),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(Some(frame)))) => {
                    break (u16::from(frame.code), Some(frame.reason.to_string()))
                }
                Some(Ok(Message::Close(None))) => break (protocol::CONNECTION_REFUSED, None),
                Some(Ok(Message::Frame(_))) => self.emit(Event::error(
                    self.id,
                    TransportError::InvalidMessageType,
                    "Invalid message type",
                )),
            }
        };

        self.link.store(LinkState::Closing);
        link_closed.cancel();
        let _ = heartbeat.await;
        {
            // Wait out any write in flight before dropping the channel.
            let _gate = self.gate.lock().await;
            self.outbound.lock().take();
        }
        let _ = writer.await;
        close
    }
}

/// Ping every `ping_interval`, re-arming only after each ping attempt
async fn heartbeat(inner: Arc<Inner>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(inner.config.ping_interval) => {}
        }
        inner.ping().await;
    }
}

/// Connection attempts for one `connect` call, repeated while auto-reconnect is on
async fn drive(inner: Arc<Inner>, outcome: watch::Sender<Outcome>) {
    let id = inner.id;
    loop {
        if inner.is_disposed() {
            break;
        }
        inner.link.store(LinkState::Connecting);
        inner.emit(Event::Connecting { id });

        let opened = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            opened = inner.open() => opened,
        };

        match opened {
            Ok(ws) => {
                let (code, reason) = inner.run(ws, &outcome).await;
                inner.link.store(LinkState::Closed);
                info!(%id, code, "Disconnected");
                inner.emit(Event::disconnected(id, code, reason.as_deref()));
            }
            Err(e) => {
                inner.link.store(LinkState::Closed);
                let message = e.to_string();
                debug!(%id, "Connection attempt failed: {}", message);
                outcome.send_replace(Some(Err(message.clone())));
                inner.emit(Event::error(id, e, message));
                inner.emit(Event::disconnected(id, protocol::CONNECTION_REFUSED, None));
            }
        }

        if !inner.config.auto_reconnect || inner.is_disposed() {
            if matches!(*outcome.borrow(), Some(Ok(()))) {
                outcome.send_replace(Some(Err("Connection closed".to_string())));
            }
            break;
        }
        outcome.send_replace(None);

        match inner.config.reconnect_delay {
            Some(delay) => tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            },
            None => tokio::task::yield_now().await,
        }
    }
    inner.link.store(LinkState::Closed);
}

/// WebSocket client with heartbeat and optional auto-reconnect
pub struct Client {
    inner: Arc<Inner>,
    driver: Mutex<Option<(JoinHandle<()>, watch::Receiver<Outcome>)>>,
}

impl Client {
    /// Create a client for a `ws://` or `wss://` endpoint
    ///
    /// The client's id is appended to the endpoint's query string so the
    /// server recognizes it across reconnects.
    pub fn new(endpoint: &str, config: ClientConfig) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
        };
        let mut url = Url::parse(endpoint).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid());
        }
        config.validate()?;
        let protocol = HeaderValue::from_str(&config.sub_protocol).map_err(|_| {
            TransportError::InvalidConfig(format!("invalid sub-protocol: {}", config.sub_protocol))
        })?;

        let id = ClientId::new();
        url.query_pairs_mut()
            .append_pair(protocol::CLIENT_ID_QUERY_KEY, &id.to_string());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                endpoint: url,
                protocol,
                config,
                link: AtomicLinkState::default(),
                events,
                disposed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                gate: tokio::sync::Mutex::new(()),
                outbound: Mutex::new(None),
            }),
            driver: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Endpoint including the client id query parameter
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn is_secure(&self) -> bool {
        self.inner.endpoint.scheme() == "wss"
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.config.auto_reconnect
    }

    pub fn ping_interval(&self) -> Duration {
        self.inner.config.ping_interval
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    fn ensure_alive(&self) -> Result<(), TransportError> {
        if self.inner.is_disposed() {
            return Err(TransportError::Disposed("Client"));
        }
        Ok(())
    }

    pub fn state(&self) -> Result<ClientState, TransportError> {
        self.ensure_alive()?;
        Ok(self.inner.link.load()?.into())
    }

    /// Open the connection
    ///
    /// While an attempt is already pending or connected this waits on that
    /// attempt instead of opening a second connection.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.ensure_alive()?;
        let mut outcome = {
            let mut driver = self.driver.lock();
            match driver.as_ref() {
                Some((handle, outcome)) if !handle.is_finished() => outcome.clone(),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    let handle = tokio::spawn(drive(Arc::clone(&self.inner), tx));
                    *driver = Some((handle, rx.clone()));
                    rx
                }
            }
        };

        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match settled {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(TransportError::ConnectFailed(message)),
            None => {
                self.ensure_alive()?;
                Err(TransportError::ConnectFailed("Connection attempt was abandoned".into()))
            }
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.ensure_alive()?;
        self.inner.write(Message::Text(text.into())).await
    }

    pub async fn send_binary(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.ensure_alive()?;
        self.inner.write(Message::Binary(bytes.into())).await
    }

    /// Read exactly `len` bytes from `reader` and send them as one binary frame
    pub async fn send_stream<R>(&self, reader: R, len: usize) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_alive()?;
        let mut buf = Vec::with_capacity(len);
        reader.take(len as u64).read_to_end(&mut buf).await?;
        if buf.len() != len {
            return Err(TransportError::LengthMismatch {
                read: buf.len(),
                expected: len,
            });
        }
        self.inner.write(Message::Binary(buf)).await
    }

    /// Close the connection for good
    ///
    /// Stops the heartbeat and any reconnect loop; later calls to the
    /// client fail with [`TransportError::Disposed`] and no further events
    /// are emitted.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        // Acknowledge any ping or send still holding the gate.
        drop(self.inner.gate.lock().await);
        self.inner.outbound.lock().take();

        let driver = self.driver.lock().take();
        if let Some((handle, _)) = driver {
            let _ = handle.await;
        }
        debug!(id = %self.inner.id, "Client disposed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Client {}

impl Hash for Client {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("link", &self.inner.link.load().ok())
            .finish()
    }
}
