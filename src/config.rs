//! Configuration types
//!
//! Plain structs with sensible defaults, no global state. Each exposes a
//! `validate()` that constructors call before allocating anything.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportError;
use crate::protocol::DEFAULT_SUB_PROTOCOL;

/// Work queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of long-running worker loops
    pub workers: usize,
    /// Maximum number of queued items; `None` means unbounded
    pub capacity: Option<usize>,
    /// How long shutdown waits for workers to drain
    pub shutdown_grace: Duration,
}

impl QueueConfig {
    /// A single worker draining in FIFO order
    pub fn serial(capacity: usize) -> Self {
        Self {
            workers: 1,
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.workers == 0 {
            return Err(TransportError::InvalidConfig(
                "workers should be greater than zero.".into(),
            ));
        }
        if self.capacity == Some(0) {
            return Err(TransportError::InvalidConfig(
                "capacity should be greater than zero.".into(),
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    /// | Field          | Default   |
    /// |----------------|-----------|
    /// | workers        | 1         |
    /// | capacity       | unbounded |
    /// | shutdown_grace | 250 ms    |
    fn default() -> Self {
        Self {
            workers: 1,
            capacity: None,
            shutdown_grace: Duration::from_millis(250),
        }
    }
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,
    /// Sub-protocols the server accepts
    pub sub_protocols: Vec<String>,
    /// Silence after which a session is evicted
    pub inactivity_timeout: Duration,
    /// Interval of the broadcast heartbeat ping
    pub heartbeat_interval: Duration,
    /// Upper bound on the WebSocket handshake
    pub negotiation_timeout: Duration,
    /// Upper bound on a single socket write
    pub send_timeout: Duration,
    /// Connections queued for handling before the accept loop blocks
    pub handler_capacity: usize,
    /// Connections handled in parallel
    pub handler_workers: usize,
    /// Pending session operations before callers block
    pub sequencer_capacity: usize,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.inactivity_timeout <= self.heartbeat_interval {
            return Err(TransportError::InvalidConfig(format!(
                "inactivity timeout ({:?}) should be greater than the heartbeat interval ({:?})",
                self.inactivity_timeout, self.heartbeat_interval
            )));
        }
        if self.sub_protocols.is_empty() {
            return Err(TransportError::InvalidConfig(
                "at least one sub-protocol is required".into(),
            ));
        }
        if self.handler_capacity == 0 || self.handler_workers == 0 || self.sequencer_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "queue capacities and worker counts should be greater than zero.".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    /// | Field               | Default                |
    /// |---------------------|------------------------|
    /// | bind_addr           | `127.0.0.1:8080`       |
    /// | sub_protocols       | `["session-transport"]`|
    /// | inactivity_timeout  | 30 s                   |
    /// | heartbeat_interval  | 10 s                   |
    /// | negotiation_timeout | 3 s                    |
    /// | send_timeout        | 3 s                    |
    /// | handler_capacity    | 1000                   |
    /// | handler_workers     | available parallelism  |
    /// | sequencer_capacity  | 4000                   |
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            sub_protocols: vec![DEFAULT_SUB_PROTOCOL.to_string()],
            inactivity_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(3),
            handler_capacity: 1000,
            handler_workers: parallelism,
            sequencer_capacity: 4000,
        }
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval between heartbeat pings
    pub ping_interval: Duration,
    /// Reconnect whenever the connection closes
    pub auto_reconnect: bool,
    /// Sub-protocol offered during the handshake
    pub sub_protocol: String,
    /// Upper bound on opening the connection
    pub connect_timeout: Duration,
    /// Upper bound on a single socket write
    pub send_timeout: Duration,
    /// Pause before each reconnect attempt; `None` retries immediately
    pub reconnect_delay: Option<Duration>,
}

impl ClientConfig {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            ping_interval,
            ..Self::default()
        }
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn sub_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.sub_protocol = protocol.into();
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.ping_interval.is_zero() {
            return Err(TransportError::InvalidConfig(
                "ping interval should be greater than zero.".into(),
            ));
        }
        if self.sub_protocol.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "sub-protocol should not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    /// | Field           | Default               |
    /// |-----------------|-----------------------|
    /// | ping_interval   | 10 s                  |
    /// | auto_reconnect  | false                 |
    /// | sub_protocol    | `"session-transport"` |
    /// | connect_timeout | 10 s                  |
    /// | send_timeout    | 3 s                   |
    /// | reconnect_delay | none                  |
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            auto_reconnect: false,
            sub_protocol: DEFAULT_SUB_PROTOCOL.to_string(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(3),
            reconnect_delay: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config_is_valid() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(cfg.handler_capacity, 1000);
        assert!(cfg.handler_workers >= 1);
    }

    #[test]
    fn test_timeout_must_exceed_heartbeat() {
        let cfg = ServerConfig {
            inactivity_timeout: Duration::from_secs(10),
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_queue_config_rejects_zero() {
        let zero_workers = QueueConfig {
            workers: 0,
            ..QueueConfig::default()
        };
        assert!(zero_workers.validate().is_err());
        assert!(QueueConfig::serial(0).validate().is_err());
        assert!(QueueConfig::serial(1).validate().is_ok());
    }

    #[test]
    fn test_client_config_builders() {
        let cfg = ClientConfig::new(Duration::from_secs(5))
            .auto_reconnect(true)
            .sub_protocol("basic");
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.sub_protocol, "basic");
        assert!(cfg.reconnect_delay.is_none());
        assert!(cfg.validate().is_ok());
        assert!(ClientConfig::new(Duration::ZERO).validate().is_err());
    }
}
