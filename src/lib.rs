//! Event-driven WebSocket Transport Library
//!
//! A WebSocket server and client built with tokio-tungstenite, with
//! application-level session management on top.
//!
//! # Features
//! - Addressable sessions keyed by a client-chosen correlation id
//! - Targeted send and broadcast with per-session ordering
//! - Heartbeat ping/pong and inactivity eviction
//! - Bounded connection handling with backpressure on accept
//! - Client auto-reconnect
//!
//! # Architecture
//! Built around [`WorkQueue`], a bounded producer/consumer queue:
//! - The `Server` hands accepted connections to a multi-worker queue
//! - `SessionManager` routes keep-alive, send, broadcast and close through a
//!   single-worker queue, so operations on a session never interleave
//! - Each connection has a writer task draining an `mpsc` channel
//! - `Server` and `Client` publish [`Event`]s on a `broadcast` channel
//!
//! # Example
//! ```ignore
//! use session_transport::{Event, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::new("127.0.0.1:8080".parse()?))?;
//!     let mut events = server.subscribe();
//!     server.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let Event::Payload { id, text: Some(text), .. } = event {
//!             server.manager().send_text(id, text).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod types;
pub mod udp;

// Re-export main types for convenience
pub use client::{Client, ClientState};
pub use config::{ClientConfig, QueueConfig, ServerConfig};
pub use error::{ErrorSink, QueueError, TransportError};
pub use event::{Event, EventKind, PayloadKind};
pub use manager::SessionManager;
pub use queue::{job, Job, WorkQueue};
pub use server::Server;
pub use session::Session;
pub use types::ClientId;
pub use udp::{Datagram, UdpListener};
