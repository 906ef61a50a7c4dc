/// Client side: a persistent connection multiplexing one request per stream

mod builder;
mod multiplexer;

pub use builder::{Client, QuicClient, ResponseHandle};
pub use multiplexer::{ClientConnection, MultiplexerStats};
