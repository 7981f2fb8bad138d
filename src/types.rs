//! Basic type definitions
//!
//! Provides the `ClientId` newtype: the correlation id a client picks for
//! itself and carries across reconnects.

use serde::Serialize;
use uuid::Uuid;

/// Correlation identifier for a client or server session (newtype pattern)
///
/// Wraps a UUID v4. A client mints one at construction and keeps it for its
/// whole lifetime; the server adopts it from the handshake query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied value.
    ///
    /// Returns `None` for anything that is not a UUID, and for the nil UUID,
    /// so a caller can fall back to a fresh id.
    pub fn parse(value: &str) -> Option<Self> {
        match Uuid::parse_str(value.trim()) {
            Ok(uuid) if !uuid.is_nil() => Some(Self(uuid)),
            _ => None,
        }
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
