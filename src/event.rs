//! Events emitted by servers and clients
//!
//! Uses a Serde tagged enum so the runner can print events as JSON lines.
//! Events are immutable once built; every variant carries the correlation id
//! of the client or session it concerns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::error::TransportError;
use crate::protocol;
use crate::types::ClientId;

/// Kind of a payload frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Binary,
}

/// Discriminant of an [`Event`], handy for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Payload,
}

/// Server or client event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A client is about to open its connection
    Connecting { id: ClientId },
    /// A client finished its handshake
    Connected { id: ClientId },
    /// The server accepted a client
    ClientConnected {
        id: ClientId,
        remote_endpoint: SocketAddr,
        query_params: HashMap<String, String>,
    },
    /// A connection ended
    Disconnected {
        id: ClientId,
        code: u16,
        reason: String,
    },
    /// Something went wrong on a connection
    Error {
        id: ClientId,
        #[serde(serialize_with = "serialize_error")]
        error: Arc<TransportError>,
        message: String,
    },
    /// Application data; exactly one of `text`/`bytes` is set, matching `kind`
    Payload {
        id: ClientId,
        kind: PayloadKind,
        text: Option<String>,
        bytes: Option<Vec<u8>>,
    },
}

impl Event {
    /// Build a `Disconnected` event, deriving the reason from the code when
    /// none is given
    pub fn disconnected(id: ClientId, code: u16, reason: Option<&str>) -> Self {
        let reason = match reason.map(str::trim) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => protocol::reason_for(code).to_string(),
        };
        Event::Disconnected { id, code, reason }
    }

    pub fn error(id: ClientId, error: TransportError, message: impl Into<String>) -> Self {
        Event::Error {
            id,
            error: Arc::new(error),
            message: message.into(),
        }
    }

    pub fn text(id: ClientId, text: String) -> Self {
        Event::Payload {
            id,
            kind: PayloadKind::Text,
            text: Some(text),
            bytes: None,
        }
    }

    pub fn binary(id: ClientId, bytes: Vec<u8>) -> Self {
        Event::Payload {
            id,
            kind: PayloadKind::Binary,
            text: None,
            bytes: Some(bytes),
        }
    }

    /// Correlation id of the client or session
    pub fn id(&self) -> ClientId {
        match self {
            Event::Connecting { id }
            | Event::Connected { id }
            | Event::ClientConnected { id, .. }
            | Event::Disconnected { id, .. }
            | Event::Error { id, .. }
            | Event::Payload { id, .. } => *id,
        }
    }

    /// `ClientConnected` reports as `Connected`
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connecting { .. } => EventKind::Connecting,
            Event::Connected { .. } | Event::ClientConnected { .. } => EventKind::Connected,
            Event::Disconnected { .. } => EventKind::Disconnected,
            Event::Error { .. } => EventKind::Error,
            Event::Payload { .. } => EventKind::Payload,
        }
    }
}

fn serialize_error<S: Serializer>(error: &Arc<TransportError>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_reason_from_table() {
        let id = ClientId::new();
        match Event::disconnected(id, 1006, None) {
            Event::Disconnected { code, reason, .. } => {
                assert_eq!(code, 1006);
                assert_eq!(reason, "Abnormal");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_disconnected_blank_reason_falls_back() {
        let id = ClientId::new();
        match Event::disconnected(id, 4242, Some("  ")) {
            Event::Disconnected { reason, .. } => assert_eq!(reason, "Undefined"),
            other => panic!("Wrong variant: {:?}", other),
        }
        match Event::disconnected(id, 1000, Some("bye")) {
            Event::Disconnected { reason, .. } => assert_eq!(reason, "bye"),
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_payload_populates_one_field() {
        let id = ClientId::new();
        match Event::text(id, "hi".into()) {
            Event::Payload { kind, text, bytes, .. } => {
                assert_eq!(kind, PayloadKind::Text);
                assert_eq!(text.as_deref(), Some("hi"));
                assert!(bytes.is_none());
            }
            other => panic!("Wrong variant: {:?}", other),
        }
        match Event::binary(id, vec![1, 2]) {
            Event::Payload { kind, text, bytes, .. } => {
                assert_eq!(kind, PayloadKind::Binary);
                assert!(text.is_none());
                assert_eq!(bytes, Some(vec![1, 2]));
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_client_connected_reports_connected_kind() {
        let event = Event::ClientConnected {
            id: ClientId::new(),
            remote_endpoint: "127.0.0.1:4000".parse().unwrap(),
            query_params: HashMap::new(),
        };
        assert_eq!(event.kind(), EventKind::Connected);
    }

    #[test]
    fn test_event_serialize() {
        let id = ClientId::new();
        let json = serde_json::to_string(&Event::error(id, TransportError::InvalidMessageType, "bad")).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"message\":\"bad\""));
        assert!(json.contains(&id.to_string()));
    }
}
