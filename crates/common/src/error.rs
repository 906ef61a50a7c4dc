use crate::StreamId;
use thiserror::Error;

/// Error taxonomy shared by the client and server sides.
///
/// Cloneable so a single connection-wide failure can be delivered to every
/// outstanding request handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuicMuxError {
    /// Handshake or connect failure, surfaced to whoever called `start()`.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection is not ready")]
    NotReady,

    #[error("Request on stream {stream_id} timed out")]
    Timeout { stream_id: StreamId },

    #[error("Connection closed")]
    ConnectionClosed,

    /// Unrecoverable transport failure; the connection is `Failed`.
    #[error("Transport failure: {0}")]
    TransportFatal(String),

    #[error("Stream {stream_id} reset by peer (code {code})")]
    StreamReset { stream_id: StreamId, code: u64 },

    #[error("Payload too large: {size} bytes (max {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Scheduler stopped")]
    SchedulerStopped,

    #[error("Task cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for quicmux operations
pub type Result<T> = std::result::Result<T, QuicMuxError>;

impl QuicMuxError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn transport_fatal(msg: impl Into<String>) -> Self {
        Self::TransportFatal(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Errors meaning the request died with its connection or loop rather
    /// than through anything specific to the request itself.
    pub fn is_connection_closed_class(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::TransportFatal(_) | Self::SchedulerStopped | Self::Cancelled
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for QuicMuxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<crate::ConfigError> for QuicMuxError {
    fn from(err: crate::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_class_covers_connection_wide_failures() {
        assert!(QuicMuxError::ConnectionClosed.is_connection_closed_class());
        assert!(QuicMuxError::transport_fatal("boom").is_connection_closed_class());
        assert!(QuicMuxError::SchedulerStopped.is_connection_closed_class());
        assert!(QuicMuxError::Cancelled.is_connection_closed_class());

        assert!(!QuicMuxError::NotReady.is_connection_closed_class());
        assert!(!QuicMuxError::Timeout { stream_id: StreamId::FIRST }.is_connection_closed_class());
    }

    #[test]
    fn io_errors_convert() {
        let err: QuicMuxError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "cert.pem").into();
        assert!(matches!(err, QuicMuxError::Io(ref msg) if msg.contains("cert.pem")));
    }

    #[test]
    fn timeout_message_names_stream() {
        let err = QuicMuxError::Timeout { stream_id: StreamId::new(8) };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Request on stream 8 timed out");
    }
}
