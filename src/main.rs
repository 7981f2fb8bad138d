//! WebSocket Transport Server - Entry Point
//!
//! Starts a server, prints every event as a JSON line and echoes payloads
//! back to the session they came from.

use std::env;
use std::net::SocketAddr;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use session_transport::{Event, Server, ServerConfig};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to control log level, e.g. RUST_LOG=session_transport=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("session_transport=info")),
        )
        .init();

    let addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
        .parse()?;

    let server = Server::new(ServerConfig::new(addr))?;
    server
        .manager()
        .register_log_handler(|line| info!(target: "session_transport::sessions", "{}", line));
    let mut events = server.subscribe();
    let accept = server.start().await?;

    info!("WebSocket Transport Server listening on {}", addr);

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event printer lagged, skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        println!("{}", serde_json::to_string(&event)?);

        if let Event::Payload { id, text, bytes, .. } = event {
            let echoed = match (text, bytes) {
                (Some(text), _) => server.manager().send_text(id, text).await,
                (_, Some(bytes)) => server.manager().send_binary(id, bytes).await,
                _ => Ok(()),
            };
            if let Err(e) = echoed {
                warn!(%id, "Echo failed: {}", e);
            }
        }
    }

    server.shutdown().await;
    let _ = accept.await;
    info!("Server stopped");
    Ok(())
}
