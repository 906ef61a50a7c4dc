use super::multiplexer::{ClientConnection, MultiplexerStats};
use crate::completion::Completion;
use crate::lifecycle::{ConnectionState, StateWatch};
use crate::scheduler::{EventSender, Scheduler};
use crate::transport::{self, QuicSession, TransportEvent};
use bytes::Bytes;
use quicmux_common::{EndpointConfig, QuicMuxError, Result, Role, StreamId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

type ClientLoop = Scheduler<ClientConnection<QuicSession<TransportEvent>>>;

/// How long `close()` waits for the transport to confirm the close
const CLOSE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Fluent builder for a persistent, multiplexed QUIC client
///
/// ```no_run
/// use quicmux_core::client::QuicClient;
/// use std::time::Duration;
///
/// let client = QuicClient::new()
///     .with_host("127.0.0.1")
///     .with_port(4433)
///     .insecure(true)
///     .start()?;
/// let reply = client.request("hi", Some(Duration::from_secs(5)))?;
/// assert_eq!(&reply[..], b"hi");
/// client.close();
/// # Ok::<(), quicmux_common::QuicMuxError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct QuicClient {
    config: EndpointConfig,
}

impl QuicClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: EndpointConfig) -> Self {
        Self { config }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config = self.config.with_host(host);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config = self.config.with_port(port);
        self
    }

    /// CA bundle used to verify the server certificate
    pub fn with_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_ca(path);
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config = self.config.with_server_name(name);
        self
    }

    /// Skip server certificate verification
    pub fn insecure(mut self, value: bool) -> Self {
        self.config = self.config.insecure(value);
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.config = self.config.with_max_message_size(limit);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_connect_timeout(timeout);
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.config = self.config.with_close_grace(grace);
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Connect and block until the handshake completed
    ///
    /// Handshake failures and timeouts surface here as `Connection` errors.
    pub fn start(self) -> Result<Client> {
        self.config.validate(Role::Client)?;
        let remote = transport::resolve(&self.config.host, self.config.port)?;

        let scheduler: Arc<ClientLoop> = Arc::new(Scheduler::new(format!("client-{}", remote)));
        let config = self.config.clone();
        scheduler.start(move |events: EventSender<TransportEvent>| {
            let endpoint = transport::bind_client(&config, remote)?;
            let session =
                QuicSession::connect(endpoint, remote, config.effective_server_name(), events)?;
            Ok(ClientConnection::new(session, config.max_message_size))
        })?;

        let (ready, watch) = scheduler
            .submit(|conn| (conn.wait_ready(), conn.watch()))
            .wait()?;

        let timeout = self.config.connect_timeout();
        let outcome = ready.wait_timeout(timeout).unwrap_or_else(|_| {
            Err(QuicMuxError::connection(format!(
                "handshake with {} timed out after {:?}",
                remote, timeout
            )))
        });
        if let Err(e) = outcome {
            scheduler.stop();
            return Err(e);
        }

        info!("Client connected to {}", remote);
        Ok(Client {
            scheduler,
            watch,
            remote,
            close_grace: self.config.close_grace(),
            closed: AtomicBool::new(false),
        })
    }
}

/// A connected client; safe to share between threads
pub struct Client {
    scheduler: Arc<ClientLoop>,
    watch: StateWatch,
    remote: SocketAddr,
    close_grace: Duration,
    closed: AtomicBool,
}

impl Client {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.watch.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Send `payload` on a fresh stream and return a handle to its reply
    ///
    /// With a `timeout`, the request is expired on the loop thread once it
    /// elapses and the handle resolves with `Timeout`.
    pub fn send(&self, payload: impl Into<Bytes>, timeout: Option<Duration>) -> Result<ResponseHandle> {
        if !self.is_ready() {
            return Err(QuicMuxError::NotReady);
        }

        let payload = payload.into();
        let (stream_id, completion) = self
            .scheduler
            .submit(move |conn| conn.begin_request(payload, timeout))
            .wait()??;

        Ok(ResponseHandle {
            stream_id,
            completion,
            scheduler: self.scheduler.clone(),
        })
    }

    /// `send` followed by `result`
    pub fn request(&self, payload: impl Into<Bytes>, timeout: Option<Duration>) -> Result<Bytes> {
        self.send(payload, timeout)?.result()
    }

    pub fn stats(&self) -> Result<MultiplexerStats> {
        self.scheduler.submit(|conn| conn.stats()).wait()
    }

    /// Orderly shutdown
    ///
    /// New sends are refused at once, in-flight requests get the close grace
    /// to finish, leftovers fail with `ConnectionClosed`, then the loop
    /// thread is stopped. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing client connection to {}", self.remote);

        if let Ok(drained) = self.scheduler.submit(|conn| conn.begin_close()).wait() {
            if drained.wait_timeout(self.close_grace).is_err() {
                debug!("Close grace elapsed with requests still in flight");
            }
        }
        if let Ok(closed) = self.scheduler.submit(|conn| conn.finish_close()).wait() {
            let _ = closed.wait_timeout(CLOSE_CONFIRM_TIMEOUT);
        }
        self.scheduler.stop();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Caller-side view of one outstanding request
pub struct ResponseHandle {
    stream_id: StreamId,
    completion: Completion<Bytes>,
    scheduler: Arc<ClientLoop>,
}

impl ResponseHandle {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_ready(&self) -> bool {
        self.completion.is_ready()
    }

    /// Block until the reply or an error arrives
    pub fn result(self) -> Result<Bytes> {
        self.completion.wait()
    }

    /// Block for at most `timeout`; on expiry the request is given up
    pub fn result_timeout(self, timeout: Duration) -> Result<Bytes> {
        match self.completion.wait_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(completion) => {
                let stream_id = self.stream_id;
                let _ = self.scheduler.submit(move |conn| conn.expire(stream_id)).wait();
                // Resolved by now: expired, completed just before, or dropped with the loop
                completion.wait()
            }
        }
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("stream_id", &self.stream_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}
