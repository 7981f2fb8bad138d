//! Session manager
//!
//! Owns the registry of live sessions. Registration and removal happen
//! immediately; every operation that must be ordered against other
//! operations (keep-alive, sends, broadcasts, close) runs as a job on a
//! single-worker [`WorkQueue`], so for any one session they execute in
//! exactly the order they were requested, without per-session locks.
//!
//! Two self-rescheduling timers feed the same queue: a broadcast heartbeat
//! ping and an inactivity sweep whose period equals the inactivity timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{QueueConfig, ServerConfig};
use crate::error::{ErrorSink, QueueError, TransportError};
use crate::protocol;
use crate::queue::{job, Job, WorkQueue};
use crate::session::Session;
use crate::types::ClientId;

type LogHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Registry state shared with sequencer jobs and timers
struct Registry {
    sessions: DashMap<ClientId, Arc<Session>>,
    /// Coarse lock: readers of `ids` vs. bulk teardown
    lock: RwLock<()>,
    inactivity_timeout: Duration,
    log_handler: RwLock<Option<LogHandler>>,
}

impl Registry {
    fn log(&self, line: String) {
        debug!(target: "session_transport::manager", "{}", line);
        let handler = self.log_handler.read().clone();
        if let Some(handler) = handler {
            let stamped = format!("[{}] - {}", chrono::Utc::now().format("%H:%M:%S%.3f"), line);
            handler(&stamped);
        }
    }

    fn is_stale(&self, session: &Session) -> bool {
        session.inactivity_period() >= self.inactivity_timeout
    }

    /// Look up a session, evicting it instead if it has gone quiet
    fn live(&self, id: ClientId) -> Option<Arc<Session>> {
        let session = self.sessions.get(&id).map(|s| Arc::clone(s.value()))?;
        if self.is_stale(&session) {
            self.evict(&session);
            return None;
        }
        Some(session)
    }

    fn evict(&self, session: &Arc<Session>) {
        if self
            .sessions
            .remove_if(&session.id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
        {
            self.log(format!(
                "Removing: {} - InactivityTimeout: {:?}",
                session.id, self.inactivity_timeout
            ));
            session.close();
            self.log(format!("Removed: {}", session.id));
        }
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Evict every session whose inactivity period reached the timeout
    fn sweep(&self) -> usize {
        self.log(format!("Sessions: {} - Sweeping dead sessions...", self.sessions.len()));
        let stale: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|s| self.is_stale(s))
            .collect();
        for session in &stale {
            self.evict(session);
        }
        self.log(format!(
            "Sessions: {} - Swept dead sessions, evicted: {}",
            self.sessions.len(),
            stale.len()
        ));
        stale.len()
    }

    async fn ping_all(&self) {
        self.log(format!("Sessions: {} - Sending broad ping...", self.sessions.len()));
        let targets: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter_map(|s| self.live(s.id))
            .collect();
        join_all(targets.iter().map(|s| deliver(s, Message::Binary(protocol::PING.to_vec().into())))).await;
        self.log(format!("Sessions: {} - Sent broad ping.", self.sessions.len()));
    }

    async fn send_to(&self, id: ClientId, msg: Message) {
        if let Some(session) = self.live(id) {
            deliver(&session, msg).await;
        }
    }

    async fn broadcast(&self, msg: Message) {
        let targets: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter_map(|s| self.live(s.id))
            .collect();
        join_all(targets.iter().map(|s| deliver(s, msg.clone()))).await;
    }
}

/// Best-effort write; failures are logged, never retried
async fn deliver(session: &Session, msg: Message) {
    if let Err(e) = session.send(msg).await {
        debug!(id = %session.id, error = %e, "dropping message for session");
    }
}

/// Registry of live server sessions with ordered operations
pub struct SessionManager {
    registry: Arc<Registry>,
    sequencer: Arc<WorkQueue<Job>>,
    timers: CancellationToken,
    disposed: AtomicBool,
    heartbeat_interval: Duration,
}

impl SessionManager {
    /// Create the manager and start its heartbeat and sweep timers
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &ServerConfig, errors: Arc<ErrorSink>) -> Result<Self, TransportError> {
        config.validate()?;

        let registry = Arc::new(Registry {
            sessions: DashMap::new(),
            lock: RwLock::new(()),
            inactivity_timeout: config.inactivity_timeout,
            log_handler: RwLock::new(None),
        });
        let sequencer = Arc::new(WorkQueue::jobs(
            "session-sequencer",
            QueueConfig::serial(config.sequencer_capacity),
            errors,
        )?);
        let timers = CancellationToken::new();

        spawn_timer(
            config.heartbeat_interval,
            timers.clone(),
            Arc::downgrade(&registry),
            Arc::downgrade(&sequencer),
            |registry| {
                job(move || async move {
                    registry.ping_all().await;
                    Ok(())
                })
            },
        );
        spawn_timer(
            config.inactivity_timeout,
            timers.clone(),
            Arc::downgrade(&registry),
            Arc::downgrade(&sequencer),
            |registry| {
                job(move || async move {
                    let evicted = registry.sweep();
                    if evicted > 0 {
                        info!(evicted, "evicted inactive sessions");
                    }
                    Ok(())
                })
            },
        );

        Ok(Self {
            registry,
            sequencer,
            timers,
            disposed: AtomicBool::new(false),
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    /// Silence after which a session is evicted
    pub fn inactivity_timeout(&self) -> Duration {
        self.registry.inactivity_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Ids of all current sessions
    pub fn ids(&self) -> Vec<ClientId> {
        let _guard = self.registry.lock.read();
        self.registry.sessions.iter().map(|s| *s.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.registry.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.sessions.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.registry.sessions.contains_key(&id)
    }

    /// Receive the manager's log lines (adds, removals, sweeps, heartbeats)
    pub fn register_log_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.registry.log_handler.write() = Some(Arc::new(handler));
    }

    /// Register a session, replacing and closing any session with the same id
    pub fn add(&self, session: Session) -> Result<Arc<Session>, TransportError> {
        let _guard = self.registry.lock.read();
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed("SessionManager"));
        }
        let id = session.id;
        let session = Arc::new(session);
        if let Some(previous) = self.registry.sessions.insert(id, Arc::clone(&session)) {
            self.registry.log(format!("Replaced: {}", id));
            previous.close();
        }
        self.registry.log(format!("Added: {}", id));
        Ok(session)
    }

    /// Drop a session from the registry; unknown ids are ignored
    pub fn remove(&self, id: ClientId) {
        if self.registry.sessions.remove(&id).is_some() {
            self.registry.log(format!("Removed: {}", id));
        }
    }

    /// Drop `session` only if it is still the one registered under its id
    pub fn remove_session(&self, session: &Arc<Session>) {
        if self
            .registry
            .sessions
            .remove_if(&session.id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
        {
            self.registry.log(format!("Removed: {}", session.id));
        }
    }

    /// Refresh a session's liveness; a no-op if it was already evicted
    pub async fn keep_alive(&self, id: ClientId) -> Result<(), QueueError> {
        let registry = Arc::clone(&self.registry);
        self.sequencer
            .add(job(move || async move {
                if let Some(session) = registry.sessions.get(&id) {
                    session.keep_alive();
                }
                Ok(())
            }))
            .await
    }

    /// Send a text frame to one session
    ///
    /// A missing or stale session drops the message silently.
    pub async fn send_text(&self, id: ClientId, text: impl Into<String>) -> Result<(), QueueError> {
        self.send(id, Message::Text(text.into())).await
    }

    /// Send a binary frame to one session
    pub async fn send_binary(&self, id: ClientId, bytes: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        self.send(id, Message::Binary(bytes.into())).await
    }

    /// Read `reader` to the end and send it as one binary frame
    ///
    /// Reading happens in order with the session's other operations; a read
    /// failure is reported to the manager's error sink.
    pub async fn send_stream<R>(&self, id: ClientId, mut reader: R) -> Result<(), QueueError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        self.sequencer
            .add(job(move || async move {
                let Some(session) = registry.live(id) else {
                    return Ok(());
                };
                let mut buf = Vec::new();
                if let Err(e) = reader.read_to_end(&mut buf).await {
                    return Err(TransportError::Io(e));
                }
                deliver(&session, Message::Binary(buf.into())).await;
                Ok(())
            }))
            .await
    }

    async fn send(&self, id: ClientId, msg: Message) -> Result<(), QueueError> {
        let registry = Arc::clone(&self.registry);
        self.sequencer
            .add(job(move || async move {
                registry.send_to(id, msg).await;
                Ok(())
            }))
            .await
    }

    /// Send a text frame to every session
    pub async fn broadcast_text(&self, text: impl Into<String>) -> Result<(), QueueError> {
        self.broadcast(Message::Text(text.into())).await
    }

    /// Send a binary frame to every session
    pub async fn broadcast_binary(&self, bytes: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        self.broadcast(Message::Binary(bytes.into())).await
    }

    async fn broadcast(&self, msg: Message) -> Result<(), QueueError> {
        let registry = Arc::clone(&self.registry);
        self.sequencer
            .add(job(move || async move {
                registry.broadcast(msg).await;
                Ok(())
            }))
            .await
    }

    /// Remove a session and close its connection
    pub async fn close(&self, id: ClientId) -> Result<(), QueueError> {
        let registry = Arc::clone(&self.registry);
        self.sequencer
            .add(job(move || async move {
                registry.log(format!("Attempting to close: {}, ...", id));
                match registry.sessions.remove(&id) {
                    Some((_, session)) => {
                        registry.log(format!("Closing: {}...", id));
                        session.close();
                        registry.log(format!("Closed: {}.", id));
                        drop(session);
                        registry.log(format!("Disposed: {}.", id));
                    }
                    None => registry.log(format!(
                        "Attempting to close: {}, Id not found in the sessions.",
                        id
                    )),
                }
                Ok(())
            }))
            .await
    }

    /// Wait until every operation enqueued before this call has run
    pub async fn flush(&self) -> Result<(), QueueError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.sequencer
            .add(job(move || async move {
                let _ = done_tx.send(());
                Ok(())
            }))
            .await?;
        done_rx.await.map_err(|_| QueueError::Closed)
    }

    /// Stop the timers, drain queued operations and close every session
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.log("SessionManager disposing...".to_string());
        self.timers.cancel();
        self.sequencer.shutdown().await;

        {
            let _guard = self.registry.lock.write();
            for session in self.registry.snapshot() {
                self.registry.log(format!("Closing: {}...", session.id));
                session.close();
            }
            self.registry.sessions.clear();
        }
        self.registry.log("SessionManager disposed.".to_string());
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.sessions.len())
            .field("inactivity_timeout", &self.registry.inactivity_timeout)
            .finish()
    }
}

/// Periodically enqueue a job, re-arming only after the previous one ran
fn spawn_timer(
    period: Duration,
    stop: CancellationToken,
    registry: Weak<Registry>,
    sequencer: Weak<WorkQueue<Job>>,
    make_job: fn(Arc<Registry>) -> Job,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            let (Some(registry), Some(sequencer)) = (registry.upgrade(), sequencer.upgrade()) else {
                break;
            };

            let (done_tx, done_rx) = oneshot::channel::<()>();
            let tick = make_job(registry);
            let tracked = job(move || async move {
                let result = tick().await;
                let _ = done_tx.send(());
                result
            });

            if sequencer.add(tracked).await.is_err() {
                break;
            }
            drop(sequencer);
            let _ = done_rx.await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn config() -> ServerConfig {
        ServerConfig {
            inactivity_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            ..ServerConfig::default()
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(&config(), Arc::new(ErrorSink::new())).unwrap()
    }

    fn session(id: ClientId) -> (Session, mpsc::Receiver<Message>, CancellationToken) {
        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        (
            Session::new(id, tx, token.clone(), Duration::from_secs(1)),
            rx,
            token,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let mgr = manager();
        let id = ClientId::new();
        let (s, _rx, _token) = session(id);

        mgr.add(s).unwrap();
        assert_eq!(mgr.ids(), vec![id]);
        assert!(mgr.contains(id));

        mgr.remove(id);
        mgr.remove(id);
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_add_replaces_and_closes_previous() {
        let mgr = manager();
        let id = ClientId::new();
        let (first, _rx1, first_token) = session(id);
        let (second, _rx2, second_token) = session(id);

        let first = mgr.add(first).unwrap();
        mgr.add(second).unwrap();

        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(mgr.len(), 1);

        // The stale handler finishing must not drop the new session.
        mgr.remove_session(&first);
        assert!(mgr.contains(id));
    }

    #[tokio::test]
    async fn test_sends_arrive_in_order() {
        let mgr = manager();
        let id = ClientId::new();
        let (s, mut rx, _token) = session(id);
        mgr.add(s).unwrap();

        for n in 0..20 {
            mgr.send_text(id, format!("m{}", n)).await.unwrap();
        }
        mgr.send_binary(id, vec![7u8, 8]).await.unwrap();
        mgr.send_stream(id, &b"streamed"[..]).await.unwrap();
        mgr.flush().await.unwrap();

        let received = drain(&mut rx);
        assert_eq!(received.len(), 22);
        for (n, msg) in received.iter().take(20).enumerate() {
            assert_eq!(msg, &Message::Text(format!("m{}", n).into()));
        }
        assert_eq!(received[20], Message::Binary(vec![7u8, 8].into()));
        assert_eq!(received[21], Message::Binary(b"streamed".to_vec().into()));
    }

    #[tokio::test]
    async fn test_send_to_unknown_id_is_silent() {
        let mgr = manager();
        assert!(mgr.send_text(ClientId::new(), "nobody").await.is_ok());
        assert!(mgr.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let mgr = manager();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (s, rx, _token) = session(ClientId::new());
            mgr.add(s).unwrap();
            receivers.push(rx);
        }

        mgr.broadcast_text("Hello From Server").await.unwrap();
        mgr.broadcast_binary(b"raw".to_vec()).await.unwrap();
        mgr.flush().await.unwrap();

        for rx in receivers.iter_mut() {
            assert_eq!(
                drain(rx),
                vec![
                    Message::Text("Hello From Server".to_string().into()),
                    Message::Binary(b"raw".to_vec().into()),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_close_removes_and_closes() {
        let mgr = manager();
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&lines);
        mgr.register_log_handler(move |line| sink.lock().push(line.to_string()));

        let id = ClientId::new();
        let (s, mut rx, token) = session(id);
        mgr.add(s).unwrap();

        mgr.close(id).await.unwrap();
        mgr.close(ClientId::new()).await.unwrap();
        mgr.flush().await.unwrap();

        assert!(token.is_cancelled());
        assert!(mgr.is_empty());
        assert_eq!(drain(&mut rx), vec![Message::Close(None)]);

        let lines = lines.lock();
        assert!(lines.iter().any(|l| l.contains(&format!("Added: {}", id))));
        let closed = lines.iter().position(|l| l.contains(&format!("Closed: {}.", id)));
        let disposed = lines.iter().position(|l| l.contains(&format!("Disposed: {}.", id)));
        assert!(closed.is_some());
        assert!(disposed > closed);
        assert!(lines.iter().any(|l| l.contains("Id not found in the sessions.")));
        assert!(lines.iter().all(|l| l.starts_with('[')));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_sessions() {
        let mgr = manager();
        let (s, mut rx, _token) = session(ClientId::new());
        mgr.add(s).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(11), rx.recv())
            .await
            .expect("heartbeat within one interval");
        assert_eq!(msg, Some(Message::Binary(protocol::PING.to_vec().into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_session_is_swept() {
        let mgr = manager();
        let id = ClientId::new();
        let (s, mut rx, token) = session(id);
        mgr.add(s).unwrap();

        tokio::time::timeout(Duration::from_secs(31), token.cancelled())
            .await
            .expect("evicted by the first sweep");
        assert!(mgr.ids().is_empty());

        mgr.send_text(id, "too late").await.unwrap();
        mgr.flush().await.unwrap();
        assert!(drain(&mut rx)
            .iter()
            .all(|m| matches!(m, Message::Binary(_) | Message::Close(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_defers_eviction() {
        let mgr = manager();
        let id = ClientId::new();
        let (s, _rx, token) = session(id);
        mgr.add(s).unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        mgr.keep_alive(id).await.unwrap();
        mgr.flush().await.unwrap();

        // First sweep at 30s sees 10s of silence.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(mgr.contains(id));
        assert!(!token.is_cancelled());

        // Second sweep at 60s sees 40s of silence.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!mgr.contains(id));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let mgr = manager();
        let mut tokens = Vec::new();
        for _ in 0..2 {
            let (s, _rx, token) = session(ClientId::new());
            mgr.add(s).unwrap();
            tokens.push(token);
        }

        mgr.shutdown().await;
        mgr.shutdown().await;

        assert!(mgr.ids().is_empty());
        assert!(tokens.iter().all(|t| t.is_cancelled()));
        assert_eq!(mgr.send_text(ClientId::new(), "x").await, Err(QueueError::Closed));

        let (late, _rx, _token) = session(ClientId::new());
        assert!(matches!(mgr.add(late), Err(TransportError::Disposed(_))));
    }
}
