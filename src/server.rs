//! WebSocket server
//!
//! The accept loop hands every TCP connection to a multi-worker
//! [`WorkQueue`] whose workers perform the handshake. A successful handshake
//! spawns a session task that registers a [`Session`] with the
//! [`SessionManager`] and runs the read loop until the peer leaves, the
//! session is closed or the server shuts down, so workers are free again as
//! soon as the handshake is done.
//!
//! Every accepted connection holds a permit from a semaphore sized to
//! `handler_capacity` until its session task ends. Once queued plus live
//! connections reach that capacity the accept loop blocks, which throttles
//! intake instead of letting connections grow without bound.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{QueueConfig, ServerConfig};
use crate::connection::{spawn_writer, OUTBOUND_BUFFER};
use crate::error::{ErrorSink, TransportError};
use crate::event::Event;
use crate::manager::SessionManager;
use crate::protocol;
use crate::queue::{job, Job, WorkQueue};
use crate::session::Session;
use crate::types::ClientId;

/// Buffered events per subscriber before it starts lagging
pub const EVENT_CAPACITY: usize = 1024;

/// State every connection handler needs
struct Shared {
    manager: Arc<SessionManager>,
    events: broadcast::Sender<Event>,
    sub_protocols: Vec<String>,
    negotiation_timeout: Duration,
    send_timeout: Duration,
    /// Parent of every connection's token
    shutdown: CancellationToken,
    /// One permit per queued or live connection
    connections: Arc<Semaphore>,
    /// Running session tasks
    sessions: TaskTracker,
}

impl Shared {
    fn emit(&self, event: Event) {
        // No subscribers is fine; the event is dropped.
        let _ = self.events.send(event);
    }
}

/// WebSocket server with session management
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    errors: Arc<ErrorSink>,
    handlers: Mutex<Option<Arc<WorkQueue<Job>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a server; nothing is bound until [`Server::start`]
    ///
    /// Must be called from within a Tokio runtime, since the session
    /// manager starts its timers here.
    pub fn new(config: ServerConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let errors = Arc::new(ErrorSink::new());
        let manager = Arc::new(SessionManager::new(&config, Arc::clone(&errors))?);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            manager,
            events,
            sub_protocols: config.sub_protocols.clone(),
            negotiation_timeout: config.negotiation_timeout,
            send_timeout: config.send_timeout,
            shutdown: CancellationToken::new(),
            connections: Arc::new(Semaphore::new(config.handler_capacity)),
            sessions: TaskTracker::new(),
        });

        Ok(Self {
            config,
            shared,
            errors,
            handlers: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the listener and launch the accept loop
    ///
    /// The returned handle completes when the accept loop exits.
    pub async fn start(&self) -> Result<JoinHandle<()>, TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::Disposed("Server"));
        }
        if self.handlers.lock().is_some() {
            return Err(TransportError::InvalidConfig("server is already started".into()));
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let pool = Arc::new(WorkQueue::jobs(
            "connection-handlers",
            QueueConfig {
                workers: self.config.handler_workers,
                capacity: Some(self.config.handler_capacity),
                shutdown_grace: self.config.send_timeout,
            },
            Arc::clone(&self.errors),
        )?);

        {
            let mut handlers = self.handlers.lock();
            if handlers.is_some() {
                return Err(TransportError::InvalidConfig("server is already started".into()));
            }
            *handlers = Some(Arc::clone(&pool));
        }
        *self.local_addr.lock() = Some(local_addr);

        info!("WebSocket server listening on {}", local_addr);

        Ok(tokio::spawn(accept_loop(
            listener,
            pool,
            Arc::clone(&self.shared),
            Arc::clone(&self.errors),
        )))
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.shared.manager
    }

    /// Connections queued for a handshake or running a session
    pub fn connection_count(&self) -> usize {
        self.config.handler_capacity - self.shared.connections.available_permits()
    }

    /// Ids of the connected sessions
    pub fn ids(&self) -> Vec<ClientId> {
        self.shared.manager.ids()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Receive accept-loop failures and failed handler jobs
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.errors.set(handler);
    }

    /// Stop accepting, end every connection and dispose the session manager
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!("Server shutting down");
        self.shared.shutdown.cancel();

        let pool = self.handlers.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        self.shared.sessions.close();
        if tokio::time::timeout(self.config.send_timeout, self.shared.sessions.wait())
            .await
            .is_err()
        {
            warn!("Sessions still running after {:?}", self.config.send_timeout);
        }
        self.shared.manager.shutdown().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pool: Arc<WorkQueue<Job>>,
    shared: Arc<Shared>,
    errors: Arc<ErrorSink>,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    errors.report(TransportError::Accept(e));
                    break;
                }
            },
        };
        debug!("New TCP connection from {}", remote);

        let permit = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&shared.connections).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let handler = {
            let shared = Arc::clone(&shared);
            job(move || handshake(stream, remote, shared, permit))
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            added = pool.add(handler) => {
                if added.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Accept loop ended");
}

/// Upgrade a TCP connection and hand it to its own session task
async fn handshake(
    stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<Shared>,
    permit: OwnedSemaphorePermit,
) -> Result<(), TransportError> {
    let mut target = String::new();
    let callback = |req: &Request, resp: Response| {
        target = req.uri().to_string();
        negotiate(req, resp, &shared.sub_protocols)
    };

    let ws = match tokio::time::timeout(
        shared.negotiation_timeout,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("Handshake with {} failed: {}", remote, e);
            return Ok(());
        }
        Err(_) => {
            warn!("Handshake with {} timed out", remote);
            return Ok(());
        }
    };

    let query_params = protocol::query_params(&target);
    let id = protocol::client_id_param(&query_params)
        .and_then(ClientId::parse)
        .unwrap_or_default();

    let session_shared = Arc::clone(&shared);
    shared.sessions.spawn(async move {
        run_session(ws, remote, id, query_params, session_shared).await;
        drop(permit);
    });
    Ok(())
}

/// Drive one upgraded connection from registration to `Disconnected`
async fn run_session(
    ws: WebSocketStream<TcpStream>,
    remote: SocketAddr,
    id: ClientId,
    query_params: HashMap<String, String>,
    shared: Arc<Shared>,
) {
    let (sink, mut stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let closer = shared.shutdown.child_token();
    let writer = spawn_writer(sink, outbound_rx, shared.send_timeout, id);

    let session = Session::new(id, outbound_tx, closer.clone(), shared.send_timeout);
    let session = match shared.manager.add(session) {
        Ok(session) => session,
        Err(e) => {
            debug!(%id, "Rejecting connection: {}", e);
            return;
        }
    };

    info!(%id, "Client connected from {}", remote);
    shared.emit(Event::ClientConnected {
        id,
        remote_endpoint: remote,
        query_params,
    });

    let clean = read_loop(&shared, &session, &mut stream, &closer).await;

    shared.manager.remove_session(&session);
    session.close();
    drop(session);
    let _ = writer.await;

    let code = if clean {
        protocol::CLOSE_NORMAL
    } else {
        protocol::CLOSE_ABNORMAL
    };
    info!(%id, code, "Client disconnected");
    shared.emit(Event::disconnected(id, code, None));
}

/// Read until the peer leaves or the session is closed
///
/// Returns whether the loop ended cleanly.
async fn read_loop<S>(
    shared: &Shared,
    session: &Session,
    stream: &mut S,
    closer: &CancellationToken,
) -> bool
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let id = session.id;
    loop {
        let next = tokio::select! {
            _ = closer.cancelled() => return true,
            next = stream.next() => next,
        };

        let msg = match next {
            None => return true,
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(%id, "Read failed: {}", e);
                shared.emit(Event::error(
                    id,
                    e.into(),
                    "Error while receiving from the connection",
                ));
                session.close();
                return false;
            }
        };

        if let Err(e) = shared.manager.keep_alive(id).await {
            debug!(%id, "Keep-alive dropped: {}", e);
        }

        match msg {
            Message::Text(text) => shared.emit(Event::text(id, text.to_string())),
            Message::Binary(bytes) if protocol::is_ping(&bytes) => {
                let pong = Message::Binary(protocol::PONG.to_vec());
                if let Err(e) = session.send(pong).await {
                    debug!(%id, "Pong not sent: {}", e);
                }
            }
            Message::Binary(bytes) if protocol::is_pong(&bytes) => {}
            Message::Binary(bytes) => shared.emit(Event::binary(id, bytes.to_vec())),
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return true,
            Message::Frame(_) => shared.emit(Event::error(
                id,
                TransportError::InvalidMessageType,
                "Invalid message type",
            )),
        }
    }
}

/// Pick the first offered sub-protocol the server accepts
///
/// A client offering none is accepted without a protocol header; one that
/// offers only unknown protocols is refused.
fn negotiate(req: &Request, mut resp: Response, accepted: &[String]) -> Result<Response, ErrorResponse> {
    let offered: Vec<&str> = req
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if offered.is_empty() {
        return Ok(resp);
    }

    let chosen = offered
        .iter()
        .find(|p| accepted.iter().any(|a| a.eq_ignore_ascii_case(p)))
        .and_then(|p| HeaderValue::from_str(p).ok());

    match chosen {
        Some(value) => {
            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            Ok(resp)
        }
        None => {
            let mut rejection = ErrorResponse::new(Some(format!(
                "None of the requested sub-protocols are supported: {}",
                offered.join(", ")
            )));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            Err(rejection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(protocols: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/?a=1");
        if let Some(p) = protocols {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, p);
        }
        builder.body(()).unwrap()
    }

    fn accepted() -> Vec<String> {
        vec!["session-transport".to_string(), "basic".to_string()]
    }

    #[test]
    fn test_negotiate_echoes_supported_protocol() {
        let resp = negotiate(&request(Some("chat, BASIC")), Response::new(()), &accepted()).unwrap();
        assert_eq!(resp.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(), "BASIC");
    }

    #[test]
    fn test_negotiate_without_offer_is_accepted() {
        let resp = negotiate(&request(None), Response::new(()), &accepted()).unwrap();
        assert!(resp.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn test_negotiate_rejects_unknown_protocols() {
        let rejection = negotiate(&request(Some("chat, superchat")), Response::new(()), &accepted())
            .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            sub_protocols: Vec::new(),
            ..ServerConfig::default()
        };
        assert!(matches!(Server::new(config), Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap())).unwrap();
        assert!(server.local_addr().is_none());

        let accept = server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.start().await.is_err());

        server.shutdown().await;
        accept.await.unwrap();
        assert!(matches!(server.start().await, Err(TransportError::Disposed(_))));
    }
}
