//! Persistent, multiplexed request/response over QUIC
//!
//! A client keeps one QUIC connection open on a dedicated loop thread and
//! maps every request to its own bidirectional stream. A server hands each
//! inbound stream to a shared handler off the loop thread and replies on
//! the same stream.

pub mod buffer;
pub mod client;
pub mod completion;
pub mod lifecycle;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use buffer::{BufferError, StreamBuffer};
pub use client::{Client, MultiplexerStats, QuicClient, ResponseHandle};
pub use completion::{Completion, Resolver};
pub use lifecycle::{ConnectionState, Lifecycle, StateWatch};
pub use scheduler::{EventSender, LoopState, Scheduler};
pub use server::{DispatchSnapshot, Echo, Handler, QuicServer, Server};
pub use transport::{Session, TransportError, TransportEvent};

pub use quicmux_common::{DispatchMode, EndpointConfig, QuicMuxError, Result, StreamId};
