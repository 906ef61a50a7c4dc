use super::dispatcher::{DispatchContext, DispatchSnapshot, DispatchStats, ErrorHook};
use super::handler::{Echo, Handler};
use super::listener::{self, Listener, ListenerEvent};
use crate::scheduler::{EventSender, Scheduler};
use crate::transport;
use quicmux_common::{DispatchMode, EndpointConfig, Result, Role, StreamId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Fluent builder for a QUIC request/response server
///
/// ```no_run
/// use quicmux_core::server::{handler, QuicServer};
///
/// let server = QuicServer::new()
///     .with_host("127.0.0.1")
///     .with_port(4433)
///     .with_cert("certs/cert.pem")
///     .with_key("certs/key.pem")
///     .with_handler(handler::uppercase())
///     .start()?;
/// server.close();
/// # Ok::<(), quicmux_common::QuicMuxError>(())
/// ```
pub struct QuicServer {
    config: EndpointConfig,
    handler: Option<Arc<dyn Handler>>,
    error_hook: Option<ErrorHook>,
}

impl Default for QuicServer {
    fn default() -> Self {
        Self::new()
    }
}

impl QuicServer {
    pub fn new() -> Self {
        Self::from_config(EndpointConfig::default())
    }

    pub fn from_config(config: EndpointConfig) -> Self {
        Self {
            config,
            handler: None,
            error_hook: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config = self.config.with_host(host);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config = self.config.with_port(port);
        self
    }

    pub fn with_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_cert(path);
        self
    }

    pub fn with_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_key(path);
        self
    }

    /// Handler shared by every stream; defaults to echo
    pub fn with_handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.config = self.config.with_dispatch_mode(mode);
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.config = self.config.with_max_message_size(limit);
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.config = self.config.with_close_grace(grace);
        self
    }

    /// Called on a worker thread whenever the handler fails or panics
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(StreamId, &anyhow::Error) + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Bind the endpoint and start accepting connections
    pub fn start(self) -> Result<Server> {
        self.config.validate(Role::Server)?;
        let addr = transport::resolve(&self.config.host, self.config.port)?;

        let ctx = DispatchContext {
            handler: self.handler.unwrap_or_else(|| Arc::new(Echo)),
            mode: self.config.dispatch_mode,
            max_message_size: self.config.max_message_size,
            error_hook: self.error_hook,
            stats: Arc::new(DispatchStats::default()),
        };
        let stats = ctx.stats.clone();

        let listener = Scheduler::new(format!("server-{}", addr));
        let config = self.config.clone();
        listener.start(move |events: EventSender<ListenerEvent>| {
            let endpoint = transport::bind_server(&config, addr)?;
            Ok(Listener::new(endpoint, ctx, events))
        })?;

        let local_addr = listener.submit(|listener| listener.local_addr()).wait()??;
        info!(
            "Server listening on {} ({:?} dispatch)",
            local_addr, self.config.dispatch_mode
        );

        Ok(Server {
            listener,
            local_addr,
            stats,
            close_grace: self.config.close_grace(),
            closed: AtomicBool::new(false),
        })
    }
}

/// A running server
pub struct Server {
    listener: Scheduler<Listener>,
    local_addr: SocketAddr,
    stats: Arc<DispatchStats>,
    close_grace: Duration,
    closed: AtomicBool,
}

impl Server {
    /// Address actually bound, useful when port 0 was requested
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Connections whose loops are still running
    pub fn connection_count(&self) -> usize {
        self.listener
            .submit(|listener| listener.connection_count())
            .wait()
            .unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    /// Stop accepting, close every connection and stop all loops
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(connections) = self.listener.submit(|listener| listener.stop_accepting()).wait() {
            listener::shutdown_connections(connections, self.close_grace);
        }
        if let Ok(idle) = self.listener.submit(|listener| listener.close_endpoint()).wait() {
            let _ = idle.wait_timeout(self.close_grace);
        }
        self.listener.stop();

        info!("Server on {} closed", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}
