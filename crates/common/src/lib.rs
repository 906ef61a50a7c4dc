pub mod config;
pub mod error;

pub use config::{protocol, ConfigError, DispatchMode, EndpointConfig};
pub use error::{QuicMuxError, Result};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number added to a stream identifier to reach the next client-initiated
/// bidirectional stream (QUIC reserves the low two bits for initiator and
/// directionality).
pub const STREAM_ID_STEP: u64 = 4;

/// Identifier of one logical stream within a connection.
///
/// Allocated by the transport, unique for the lifetime of a connection.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u64);

impl StreamId {
    /// First client-initiated bidirectional stream.
    pub const FIRST: StreamId = StreamId(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The identifier following this one in client-initiated bidirectional numbering.
    pub fn next(&self) -> Self {
        Self(self.0 + STREAM_ID_STEP)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<StreamId> for u64 {
    fn from(value: StreamId) -> Self {
        value.0
    }
}

/// Which side of the connection an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_follow_client_bidi_numbering() {
        let first = StreamId::FIRST;
        assert_eq!(first.as_u64(), 0);
        assert_eq!(first.next().as_u64(), 4);
        assert_eq!(first.next().next().as_u64(), 8);
    }

    #[test]
    fn stream_id_formats_as_number() {
        let id = StreamId::from(12);
        assert_eq!(id.to_string(), "12");
        assert_eq!(format!("{:?}", id), "StreamId(12)");
        assert_eq!(u64::from(id), 12);
    }

    #[test]
    fn stream_ids_order_by_allocation() {
        let a = StreamId::new(4);
        let b = a.next();
        assert!(a < b);
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Client.to_string(), "client");
        assert_eq!(Role::Server.to_string(), "server");
    }
}
