/// Client-side request multiplexer
///
/// Lives on the client's loop thread. Every request gets its own stream;
/// inbound data is correlated back to the waiting caller by stream id.
/// The pending map is never touched from any other thread.
use crate::buffer::{BufferError, StreamBuffer};
use crate::completion::{self, Completion, Resolver};
use crate::lifecycle::{ConnectionState, Lifecycle, StateWatch};
use crate::scheduler::LoopState;
use crate::transport::{Session, TransportEvent};
use bytes::Bytes;
use quicmux_common::{protocol, QuicMuxError, Result, StreamId};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One outstanding client call
#[derive(Debug)]
struct PendingRequest {
    resolver: Resolver<Bytes>,
    buffer: StreamBuffer,
    deadline: Option<Instant>,
}

/// Counters kept by the multiplexer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Chunks dropped because no request was waiting on their stream
    pub unknown_stream_chunks: u64,
}

/// Loop-side state of one client connection
pub struct ClientConnection<S> {
    session: S,
    lifecycle: Lifecycle,
    pending: HashMap<StreamId, PendingRequest>,
    deadlines: BTreeSet<(Instant, StreamId)>,
    max_message_size: usize,
    ready_waiters: Vec<Resolver<()>>,
    drain_waiters: Vec<Resolver<()>>,
    closed_waiters: Vec<Resolver<()>>,
    failure: Option<String>,
    session_closed: bool,
    stats: MultiplexerStats,
}

impl<S: Session> ClientConnection<S> {
    pub fn new(session: S, max_message_size: usize) -> Self {
        Self {
            session,
            lifecycle: Lifecycle::new(),
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            max_message_size,
            ready_waiters: Vec::new(),
            drain_waiters: Vec::new(),
            closed_waiters: Vec::new(),
            failure: None,
            session_closed: false,
            stats: MultiplexerStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn watch(&self) -> StateWatch {
        self.lifecycle.watch()
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.stats
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Resolves once the handshake completed, or with the reason it never will
    pub fn wait_ready(&mut self) -> Completion<()> {
        let (resolver, completion) = completion::pair();
        self.ready_waiters.push(resolver);
        self.settle_ready_waiters();
        completion
    }

    /// Open a stream for `payload` and register the caller waiting on it
    ///
    /// Fails with `NotReady` unless the connection is `Ready`; in that case
    /// no stream is allocated. The payload is written with the end flag set.
    pub fn begin_request(
        &mut self,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<(StreamId, Completion<Bytes>)> {
        if !self.lifecycle.is_ready() {
            return Err(QuicMuxError::NotReady);
        }
        if payload.len() > self.max_message_size {
            return Err(QuicMuxError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_message_size,
            });
        }

        let stream_id = self.session.next_stream_id();
        if self.pending.contains_key(&stream_id) {
            return Err(QuicMuxError::transport_fatal(format!(
                "stream {} allocated twice",
                stream_id
            )));
        }

        self.session.send_stream_data(stream_id, payload, true)?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        if let Some(at) = deadline {
            self.deadlines.insert((at, stream_id));
        }

        let (resolver, completion) = completion::pair();
        self.pending.insert(
            stream_id,
            PendingRequest {
                resolver,
                buffer: StreamBuffer::new(self.max_message_size),
                deadline,
            },
        );
        self.stats.sent += 1;
        debug!(stream_id = %stream_id, "Request sent");

        Ok((stream_id, completion))
    }

    /// Give up on a request; late data for its stream is then dropped
    pub fn expire(&mut self, stream_id: StreamId) -> bool {
        match self.take(stream_id) {
            Some(request) => {
                debug!(stream_id = %stream_id, "Request timed out");
                self.stats.timed_out += 1;
                request.resolver.fail(QuicMuxError::Timeout { stream_id });
                self.check_drained();
                true
            }
            None => false,
        }
    }

    /// Refuse new requests; resolves once every in-flight request finished
    pub fn begin_close(&mut self) -> Completion<()> {
        if self.lifecycle.begin_close() {
            info!("Client closing with {} requests in flight", self.pending.len());
        }
        self.settle_ready_waiters();

        let (resolver, completion) = completion::pair();
        self.drain_waiters.push(resolver);
        self.check_drained();
        completion
    }

    /// Fail whatever is still in flight and close the session
    ///
    /// Resolves once the transport confirmed the close.
    pub fn finish_close(&mut self) -> Completion<()> {
        self.fail_all(QuicMuxError::ConnectionClosed);
        if self.session_closed {
            return Completion::ready(Ok(()));
        }

        let (resolver, completion) = completion::pair();
        self.closed_waiters.push(resolver);
        self.session.close(protocol::CLOSE_CODE_OK, "client closing");
        completion
    }

    fn on_stream_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        let Some(request) = self.pending.get_mut(&stream_id) else {
            warn!(
                stream_id = %stream_id,
                "Dropping {} bytes for unknown stream",
                data.len()
            );
            self.stats.unknown_stream_chunks += 1;
            return;
        };

        if let Err(e) = request.buffer.append(&data) {
            if let Some(request) = self.take(stream_id) {
                warn!(stream_id = %stream_id, "Response rejected: {}", e);
                self.stats.failed += 1;
                request.resolver.fail(match e {
                    BufferError::Overflow { size, limit } => {
                        QuicMuxError::PayloadTooLarge { size, limit }
                    }
                    BufferError::Terminated => {
                        QuicMuxError::transport_fatal(format!("data after end of stream {}", stream_id))
                    }
                });
            }
            self.check_drained();
            return;
        }

        if end_stream {
            if let Some(mut request) = self.take(stream_id) {
                request.buffer.terminate();
                debug!(stream_id = %stream_id, "Response complete ({} bytes)", request.buffer.len());
                self.stats.completed += 1;
                request.resolver.succeed(request.buffer.into_bytes());
            }
            self.check_drained();
        }
    }

    fn on_stream_reset(&mut self, stream_id: StreamId, code: u64) {
        match self.take(stream_id) {
            Some(request) => {
                debug!(stream_id = %stream_id, code, "Stream reset by server");
                self.stats.failed += 1;
                let error = if code == u64::from(protocol::RESET_HANDLER_FAILED) {
                    QuicMuxError::handler(format!("server handler failed on stream {}", stream_id))
                } else {
                    QuicMuxError::StreamReset { stream_id, code }
                };
                request.resolver.fail(error);
                self.check_drained();
            }
            None => debug!(stream_id = %stream_id, "Reset for unknown stream ignored"),
        }
    }

    fn take(&mut self, stream_id: StreamId) -> Option<PendingRequest> {
        let request = self.pending.remove(&stream_id)?;
        if let Some(at) = request.deadline {
            self.deadlines.remove(&(at, stream_id));
        }
        Some(request)
    }

    fn fail_all(&mut self, error: QuicMuxError) {
        if self.pending.is_empty() {
            self.check_drained();
            return;
        }

        debug!("Failing {} pending requests: {}", self.pending.len(), error);
        self.deadlines.clear();
        for (_, request) in self.pending.drain() {
            self.stats.failed += 1;
            request.resolver.fail(error.clone());
        }
        self.check_drained();
    }

    fn check_drained(&mut self) {
        if self.pending.is_empty() {
            for waiter in self.drain_waiters.drain(..) {
                waiter.succeed(());
            }
        }
    }

    fn settle_ready_waiters(&mut self) {
        let outcome = match self.lifecycle.state() {
            ConnectionState::Connecting => return,
            ConnectionState::Ready => Ok(()),
            ConnectionState::Failed => Err(QuicMuxError::connection(
                self.failure.as_deref().unwrap_or("connection failed"),
            )),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(QuicMuxError::ConnectionClosed)
            }
        };

        for waiter in self.ready_waiters.drain(..) {
            waiter.resolve(outcome.clone());
        }
    }

    fn settle_closed_waiters(&mut self) {
        self.session_closed = true;
        for waiter in self.closed_waiters.drain(..) {
            waiter.succeed(());
        }
    }
}

impl<S: Session + 'static> LoopState for ClientConnection<S> {
    type Event = TransportEvent;

    fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::HandshakeCompleted => {
                if let Err(e) = self.lifecycle.on_handshake_completed() {
                    warn!("Ignoring handshake completion: {}", e);
                }
                self.settle_ready_waiters();
            }
            TransportEvent::StreamData {
                stream_id,
                data,
                end_stream,
            } => self.on_stream_data(stream_id, data, end_stream),
            TransportEvent::StreamReset { stream_id, code } => self.on_stream_reset(stream_id, code),
            TransportEvent::ConnectionClosed { code, reason } => {
                debug!(code, "Connection closed: {}", reason);
                self.lifecycle.on_closed();
                self.fail_all(QuicMuxError::ConnectionClosed);
                self.settle_ready_waiters();
                self.settle_closed_waiters();
            }
            TransportEvent::ConnectionLost { reason } => {
                self.lifecycle.fail(&reason);
                self.fail_all(QuicMuxError::transport_fatal(reason.clone()));
                self.failure = Some(reason);
                self.settle_ready_waiters();
                self.settle_closed_waiters();
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(at, _)| *at)
    }

    fn on_deadline(&mut self, now: Instant) {
        while let Some(&(at, stream_id)) = self.deadlines.first() {
            if at > now {
                break;
            }
            self.deadlines.remove(&(at, stream_id));
            self.expire(stream_id);
        }
    }

    fn is_finished(&self) -> bool {
        self.lifecycle.is_terminal() && self.session_closed
    }

    fn on_stop(&mut self) {
        self.fail_all(QuicMuxError::ConnectionClosed);
        if !self.session_closed {
            self.session.close(protocol::CLOSE_CODE_OK, "client stopped");
        }
    }
}
