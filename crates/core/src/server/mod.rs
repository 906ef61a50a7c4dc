/// Server side: accept connections and dispatch stream data to a handler

mod builder;
mod dispatcher;
pub mod handler;
mod listener;

pub use builder::{QuicServer, Server};
pub use dispatcher::{
    BlockingExecutor, DispatchContext, DispatchSnapshot, DispatchStats, ErrorHook, Executor,
    HandlerOutcome, Job, ServerConnection, ServerEvent,
};
pub use handler::{Echo, Handler};
