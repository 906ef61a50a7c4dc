/// Transport layer for quicmux using QUIC
///
/// The request/response machinery only sees the narrow, synchronous
/// `Session` interface plus a stream of `TransportEvent`s delivered on the
/// loop thread. The quinn adapter turns quinn's async stream API into that
/// contract:
/// - handshake completion
/// - per-stream data chunks with an end flag
/// - stream resets
/// - orderly close and unrecoverable loss of the connection

mod connection;
mod endpoint;
#[cfg(test)]
pub(crate) mod recording;
mod stream;
pub mod tls;

pub use connection::QuicSession;
pub use endpoint::{
    bind_client, bind_server, client_config, resolve, server_config, transport_config,
};

use bytes::Bytes;
use quicmux_common::{QuicMuxError, StreamId};

/// Events emitted by the transport, dispatched on the loop thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake finished, streams may be opened
    HandshakeCompleted,

    /// Bytes arrived on a stream; `end_stream` means the peer finished its side
    StreamData {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },

    /// The peer abandoned its side of a stream
    StreamReset { stream_id: StreamId, code: u64 },

    /// The connection was closed, locally or by the peer
    ConnectionClosed { code: u64, reason: String },

    /// The connection broke and cannot be used again
    ConnectionLost { reason: String },
}

/// Operations the loop thread performs on the underlying session
///
/// Implementations are only ever touched from the loop thread.
pub trait Session {
    /// Allocate a fresh identifier for a locally opened stream
    fn next_stream_id(&mut self) -> StreamId;

    /// Write `data` on a stream, finishing our side when `end_stream` is set
    fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError>;

    /// Abandon our side of a stream
    fn reset_stream(&mut self, stream_id: StreamId, code: u32) -> Result<(), TransportError>;

    /// Close the whole connection; a `ConnectionClosed` event follows
    fn close(&mut self, code: u32, reason: &str);
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection not established")]
    NotConnected,

    #[error("Unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Failed to create config: {0}")]
    ConfigCreation(String),

    #[error("Invalid certificate material: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for QuicMuxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => QuicMuxError::NotReady,
            TransportError::UnknownStream(_)
            | TransportError::BindFailed(_)
            | TransportError::Connect(_)
            | TransportError::Resolve(_) => {
                QuicMuxError::connection(err.to_string())
            }
            TransportError::ConfigCreation(_) | TransportError::Certificate(_) => {
                QuicMuxError::tls(err.to_string())
            }
            TransportError::Io(e) => e.into(),
        }
    }
}
