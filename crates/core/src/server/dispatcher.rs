//! Server-side dispatcher
//!
//! Turns inbound stream data into handler calls and writes each reply back
//! on the stream it came from. Handlers never run on the loop thread: every
//! call is handed to an [`Executor`] and its outcome comes back to the loop
//! as a [`ServerEvent::HandlerFinished`] event.

use super::handler::Handler;
use crate::buffer::{BufferError, StreamBuffer};
use crate::completion::{self, Completion, Resolver};
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::scheduler::{EventSender, LoopState};
use crate::transport::{Session, TransportEvent};
use bytes::Bytes;
use quicmux_common::{protocol, DispatchMode, StreamId};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Callback told about every handler failure
pub type ErrorHook = Arc<dyn Fn(StreamId, &anyhow::Error) + Send + Sync>;

/// A unit of handler work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where handler calls run
pub trait Executor: 'static {
    fn execute(&self, job: Job);
}

/// Runs jobs on the loop runtime's blocking thread pool
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingExecutor;

impl Executor for BlockingExecutor {
    fn execute(&self, job: Job) {
        tokio::task::spawn_blocking(job);
    }
}

/// What a handler call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Reply(Bytes),
    NoReply,
    Failed(String),
}

/// Events delivered to a server connection loop
#[derive(Debug)]
pub enum ServerEvent {
    Transport(TransportEvent),
    HandlerFinished {
        stream_id: StreamId,
        outcome: HandlerOutcome,
        end_stream: bool,
    },
}

impl From<TransportEvent> for ServerEvent {
    fn from(event: TransportEvent) -> Self {
        ServerEvent::Transport(event)
    }
}

/// Counters shared by every connection of one server
#[derive(Debug, Default)]
pub struct DispatchStats {
    connections: AtomicU64,
    invocations: AtomicU64,
    replies: AtomicU64,
    no_reply: AtomicU64,
    handler_errors: AtomicU64,
    rejected_streams: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub connections: u64,
    pub invocations: u64,
    pub replies: u64,
    pub no_reply: u64,
    pub handler_errors: u64,
    pub rejected_streams: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            no_reply: self.no_reply.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            rejected_streams: self.rejected_streams.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn connection_accepted(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a connection needs to dispatch, shared across connections
#[derive(Clone)]
pub struct DispatchContext {
    pub handler: Arc<dyn Handler>,
    pub mode: DispatchMode,
    pub max_message_size: usize,
    pub error_hook: Option<ErrorHook>,
    pub stats: Arc<DispatchStats>,
}

impl DispatchContext {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            mode: DispatchMode::default(),
            max_message_size: protocol::MAX_MESSAGE_SIZE,
            error_hook: None,
            stats: Arc::new(DispatchStats::default()),
        }
    }
}

enum Work {
    Invoke { data: Bytes, end_stream: bool },
    /// Peer ended the stream after chunks that were already dispatched
    Finish,
}

struct InboundStream {
    buffer: StreamBuffer,
    queue: VecDeque<Work>,
    chunks: usize,
    busy: bool,
    replied: bool,
}

impl InboundStream {
    fn new(limit: usize) -> Self {
        Self {
            buffer: StreamBuffer::new(limit),
            queue: VecDeque::new(),
            chunks: 0,
            busy: false,
            replied: false,
        }
    }
}

/// Loop-side state of one accepted connection
pub struct ServerConnection<S, X> {
    session: S,
    lifecycle: Lifecycle,
    ctx: DispatchContext,
    executor: X,
    events: EventSender<ServerEvent>,
    streams: HashMap<StreamId, InboundStream>,
    rejected: HashSet<StreamId>,
    closed_waiters: Vec<Resolver<()>>,
    session_closed: bool,
}

impl<S: Session, X: Executor> ServerConnection<S, X> {
    pub fn new(session: S, ctx: DispatchContext, executor: X, events: EventSender<ServerEvent>) -> Self {
        Self {
            session,
            lifecycle: Lifecycle::new(),
            ctx,
            executor,
            events,
            streams: HashMap::new(),
            rejected: HashSet::new(),
            closed_waiters: Vec::new(),
            session_closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Streams with data buffered or a handler call in flight
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Close the connection; resolves once the transport confirmed it
    pub fn close(&mut self) -> Completion<()> {
        if self.session_closed {
            return Completion::ready(Ok(()));
        }

        let (resolver, completion) = completion::pair();
        self.closed_waiters.push(resolver);
        self.lifecycle.begin_close();
        self.session.close(protocol::CLOSE_CODE_OK, "server shutdown");
        completion
    }

    fn on_stream_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        if self.rejected.contains(&stream_id) {
            if end_stream {
                self.rejected.remove(&stream_id);
            }
            return;
        }

        let limit = self.ctx.max_message_size;
        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| InboundStream::new(limit));

        match self.ctx.mode {
            DispatchMode::Buffered => {
                if let Err(e) = stream.buffer.append(&data) {
                    self.reject(stream_id, e, end_stream);
                    return;
                }
                if end_stream {
                    stream.buffer.terminate();
                    let payload =
                        std::mem::replace(&mut stream.buffer, StreamBuffer::new(0)).into_bytes();
                    stream.queue.push_back(Work::Invoke {
                        data: payload,
                        end_stream: true,
                    });
                }
            }
            DispatchMode::PerChunk => {
                if data.len() > limit {
                    self.reject(
                        stream_id,
                        BufferError::Overflow {
                            size: data.len(),
                            limit,
                        },
                        end_stream,
                    );
                    return;
                }
                if data.is_empty() && end_stream && stream.chunks > 0 {
                    stream.queue.push_back(Work::Finish);
                } else {
                    stream.chunks += 1;
                    stream.queue.push_back(Work::Invoke { data, end_stream });
                }
            }
        }

        self.pump(stream_id);
    }

    fn reject(&mut self, stream_id: StreamId, error: BufferError, end_stream: bool) {
        warn!(stream_id = %stream_id, "Rejecting inbound stream: {}", error);
        DispatchStats::bump(&self.ctx.stats.rejected_streams);
        self.streams.remove(&stream_id);
        if !end_stream {
            self.rejected.insert(stream_id);
        }
        if let Err(e) = self.session.reset_stream(stream_id, protocol::RESET_TOO_LARGE) {
            debug!(stream_id = %stream_id, "Reset failed: {}", e);
        }
    }

    /// Start the next queued piece of work unless a handler call is in flight
    fn pump(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.busy {
            return;
        }

        match stream.queue.pop_front() {
            Some(Work::Invoke { data, end_stream }) => {
                stream.busy = true;
                self.dispatch(stream_id, data, end_stream);
            }
            Some(Work::Finish) => {
                let replied = stream.replied;
                self.streams.remove(&stream_id);
                if replied {
                    self.send(stream_id, Bytes::new(), true);
                } else {
                    self.abandon(stream_id, protocol::RESET_NO_REPLY);
                }
            }
            None => {}
        }
    }

    fn dispatch(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        DispatchStats::bump(&self.ctx.stats.invocations);
        debug!(stream_id = %stream_id, end_stream, "Dispatching {} bytes", data.len());

        let handler = self.ctx.handler.clone();
        let hook = self.ctx.error_hook.clone();
        let events = self.events.clone();
        self.executor.execute(Box::new(move || {
            let outcome = invoke(handler.as_ref(), stream_id, data, hook.as_ref());
            events.emit(ServerEvent::HandlerFinished {
                stream_id,
                outcome,
                end_stream,
            });
        }));
    }

    fn on_handler_finished(&mut self, stream_id: StreamId, outcome: HandlerOutcome, end_stream: bool) {
        // Every path that drops a stream early also releases its writer
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            debug!(stream_id = %stream_id, "Discarding handler outcome for a closed stream");
            return;
        };
        stream.busy = false;
        let replied = stream.replied;

        match outcome {
            HandlerOutcome::Reply(reply) => {
                stream.replied = true;
                DispatchStats::bump(&self.ctx.stats.replies);
                self.send(stream_id, reply, end_stream);
            }
            HandlerOutcome::NoReply => {
                DispatchStats::bump(&self.ctx.stats.no_reply);
                if end_stream && replied {
                    self.send(stream_id, Bytes::new(), true);
                } else if end_stream {
                    self.abandon(stream_id, protocol::RESET_NO_REPLY);
                }
            }
            HandlerOutcome::Failed(_) => {
                DispatchStats::bump(&self.ctx.stats.handler_errors);
                if end_stream {
                    self.abandon(stream_id, protocol::RESET_HANDLER_FAILED);
                }
            }
        }

        if end_stream {
            self.streams.remove(&stream_id);
        } else {
            self.pump(stream_id);
        }
    }

    fn send(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        if let Err(e) = self.session.send_stream_data(stream_id, data, end_stream) {
            debug!(stream_id = %stream_id, "Reply dropped: {}", e);
        }
    }

    /// End our side of a stream without a reply so the peer is not left waiting
    fn abandon(&mut self, stream_id: StreamId, code: u32) {
        if let Err(e) = self.session.reset_stream(stream_id, code) {
            debug!(stream_id = %stream_id, "Reset failed: {}", e);
        }
    }

    fn on_transport_closed(&mut self) {
        self.streams.clear();
        self.rejected.clear();
        self.session_closed = true;
        for waiter in self.closed_waiters.drain(..) {
            waiter.succeed(());
        }
    }
}

fn invoke(
    handler: &dyn Handler,
    stream_id: StreamId,
    data: Bytes,
    hook: Option<&ErrorHook>,
) -> HandlerOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(data)))
        .unwrap_or_else(|panic| Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))));

    match result {
        Ok(Some(reply)) => HandlerOutcome::Reply(reply),
        Ok(None) => HandlerOutcome::NoReply,
        Err(e) => {
            error!(stream_id = %stream_id, "Handler failed: {:#}", e);
            if let Some(hook) = hook {
                hook(stream_id, &e);
            }
            HandlerOutcome::Failed(e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl<S: Session + 'static, X: Executor> LoopState for ServerConnection<S, X> {
    type Event = ServerEvent;

    fn on_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Transport(TransportEvent::HandshakeCompleted) => {
                if let Err(e) = self.lifecycle.on_handshake_completed() {
                    warn!("Ignoring handshake completion: {}", e);
                }
            }
            ServerEvent::Transport(TransportEvent::StreamData {
                stream_id,
                data,
                end_stream,
            }) => self.on_stream_data(stream_id, data, end_stream),
            ServerEvent::Transport(TransportEvent::StreamReset { stream_id, code }) => {
                debug!(stream_id = %stream_id, code, "Client abandoned stream");
                // Rejected streams already released their writer
                self.rejected.remove(&stream_id);
                if self.streams.remove(&stream_id).is_some() {
                    self.abandon(stream_id, protocol::RESET_NO_REPLY);
                }
            }
            ServerEvent::Transport(TransportEvent::ConnectionClosed { code, reason }) => {
                debug!(code, "Connection closed: {}", reason);
                self.lifecycle.on_closed();
                self.on_transport_closed();
            }
            ServerEvent::Transport(TransportEvent::ConnectionLost { reason }) => {
                self.lifecycle.fail(&reason);
                self.on_transport_closed();
            }
            ServerEvent::HandlerFinished {
                stream_id,
                outcome,
                end_stream,
            } => self.on_handler_finished(stream_id, outcome, end_stream),
        }
    }

    fn is_finished(&self) -> bool {
        self.lifecycle.is_terminal() && self.session_closed
    }

    fn on_stop(&mut self) {
        if !self.session_closed {
            self.session.close(protocol::CLOSE_CODE_OK, "server stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::{uppercase, Echo};
    use crate::transport::recording::RecordingSession;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Runs jobs immediately on the calling thread
    struct InlineExecutor;

    impl Executor for InlineExecutor {
        fn execute(&self, job: Job) {
            job();
        }
    }

    /// Holds jobs until the test releases them
    #[derive(Clone, Default)]
    struct ParkedExecutor {
        jobs: Arc<Mutex<Vec<Job>>>,
    }

    impl ParkedExecutor {
        fn run_all(&self) {
            let jobs: Vec<Job> = std::mem::take(&mut *self.jobs.lock().unwrap());
            for job in jobs {
                job();
            }
        }

        fn parked(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }
    }

    impl Executor for ParkedExecutor {
        fn execute(&self, job: Job) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    struct Harness<X: Executor> {
        conn: ServerConnection<RecordingSession, X>,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl<X: Executor> Harness<X> {
        fn new(ctx: DispatchContext, executor: X) -> Self {
            let (events, rx) = EventSender::channel();
            let mut conn = ServerConnection::new(RecordingSession::default(), ctx, executor, events);
            conn.on_event(TransportEvent::HandshakeCompleted.into());
            Self { conn, rx }
        }

        fn data(&mut self, id: u64, bytes: &'static [u8], end_stream: bool) {
            self.conn.on_event(
                TransportEvent::StreamData {
                    stream_id: StreamId::new(id),
                    data: Bytes::from_static(bytes),
                    end_stream,
                }
                .into(),
            );
        }

        /// Feed handler outcomes back into the loop state
        fn settle(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.conn.on_event(event);
            }
        }

        fn sent_on(&self, id: u64) -> Vec<(Bytes, bool)> {
            self.conn.session().sent_on(StreamId::new(id))
        }
    }

    fn ctx(handler: impl Handler) -> DispatchContext {
        DispatchContext::new(Arc::new(handler))
    }

    #[test]
    fn test_buffered_mode_replies_once_with_end_flag() {
        let mut h = Harness::new(ctx(uppercase()), InlineExecutor);
        h.data(0, b"he", false);
        h.data(0, b"llo", false);
        h.settle();
        assert!(h.sent_on(0).is_empty());

        h.data(0, b"", true);
        h.settle();
        assert_eq!(h.sent_on(0), vec![(Bytes::from_static(b"HELLO"), true)]);
        assert_eq!(h.conn.active_streams(), 0);
    }

    #[test]
    fn test_per_chunk_mode_mirrors_end_flags() {
        let mut context = ctx(Echo);
        context.mode = DispatchMode::PerChunk;
        let mut h = Harness::new(context, InlineExecutor);

        h.data(4, b"one", false);
        h.data(4, b"two", false);
        h.data(4, b"", true);
        h.settle();

        assert_eq!(
            h.sent_on(4),
            vec![
                (Bytes::from_static(b"one"), false),
                (Bytes::from_static(b"two"), false),
                (Bytes::new(), true),
            ]
        );
    }

    #[test]
    fn test_per_chunk_silent_final_chunk_finishes_replied_stream() {
        let mut context = ctx(|payload: Bytes| -> anyhow::Result<Option<Bytes>> {
            if payload.as_ref() == b"tail" {
                Ok(None)
            } else {
                Ok(Some(payload))
            }
        });
        context.mode = DispatchMode::PerChunk;
        let mut h = Harness::new(context, InlineExecutor);

        h.data(0, b"head", false);
        h.data(0, b"tail", true);
        h.settle();

        assert_eq!(
            h.sent_on(0),
            vec![(Bytes::from_static(b"head"), false), (Bytes::new(), true)]
        );
        assert!(h.conn.session().resets.is_empty());
        assert_eq!(h.conn.active_streams(), 0);
    }

    #[test]
    fn test_per_chunk_mode_keeps_order_while_handler_busy() {
        let executor = ParkedExecutor::default();
        let mut context = ctx(uppercase());
        context.mode = DispatchMode::PerChunk;
        let mut h = Harness::new(context, executor.clone());

        h.data(0, b"a", false);
        h.data(0, b"b", false);
        h.data(0, b"c", true);
        assert_eq!(executor.parked(), 1);

        for _ in 0..3 {
            executor.run_all();
            h.settle();
        }

        assert_eq!(
            h.sent_on(0),
            vec![
                (Bytes::from_static(b"A"), false),
                (Bytes::from_static(b"B"), false),
                (Bytes::from_static(b"C"), true),
            ]
        );
    }

    #[test]
    fn test_streams_are_dispatched_concurrently() {
        let executor = ParkedExecutor::default();
        let mut h = Harness::new(ctx(uppercase()), executor.clone());

        h.data(0, b"a", true);
        h.data(4, b"b", true);
        h.data(8, b"c", true);
        assert_eq!(executor.parked(), 3);

        executor.run_all();
        h.settle();
        assert_eq!(h.sent_on(0), vec![(Bytes::from_static(b"A"), true)]);
        assert_eq!(h.sent_on(4), vec![(Bytes::from_static(b"B"), true)]);
        assert_eq!(h.sent_on(8), vec![(Bytes::from_static(b"C"), true)]);
    }

    #[test]
    fn test_handler_error_resets_only_its_stream() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();

        let mut context = ctx(|payload: Bytes| -> anyhow::Result<Option<Bytes>> {
            if payload.as_ref() == b"bad" {
                anyhow::bail!("cannot handle");
            }
            Ok(Some(payload))
        });
        context.error_hook = Some(Arc::new(move |id: StreamId, e: &anyhow::Error| {
            seen.lock().unwrap().push((id, e.to_string()));
        }));
        let stats = context.stats.clone();

        let mut h = Harness::new(context, InlineExecutor);
        h.data(0, b"bad", true);
        h.data(4, b"good", true);
        h.settle();

        assert!(h.sent_on(0).is_empty());
        assert_eq!(
            h.conn.session().resets,
            vec![(StreamId::new(0), protocol::RESET_HANDLER_FAILED)]
        );
        assert_eq!(h.sent_on(4), vec![(Bytes::from_static(b"good"), true)]);
        assert_eq!(
            *failures.lock().unwrap(),
            vec![(StreamId::new(0), "cannot handle".to_string())]
        );
        assert_eq!(h.conn.state(), ConnectionState::Ready);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.handler_errors, 1);
        assert_eq!(snapshot.replies, 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let context = ctx(|_: Bytes| -> anyhow::Result<Option<Bytes>> { panic!("handler bug") });
        let mut h = Harness::new(context, InlineExecutor);

        h.data(0, b"x", true);
        h.settle();

        assert_eq!(
            h.conn.session().resets,
            vec![(StreamId::new(0), protocol::RESET_HANDLER_FAILED)]
        );
        assert_eq!(h.conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_no_reply_on_final_chunk_resets() {
        let context = ctx(|_: Bytes| -> anyhow::Result<Option<Bytes>> { Ok(None) });
        let mut h = Harness::new(context, InlineExecutor);

        h.data(0, b"ignored", true);
        h.settle();

        assert!(h.sent_on(0).is_empty());
        assert_eq!(
            h.conn.session().resets,
            vec![(StreamId::new(0), protocol::RESET_NO_REPLY)]
        );
    }

    #[test]
    fn test_empty_request_is_dispatched() {
        let mut h = Harness::new(ctx(Echo), InlineExecutor);
        h.data(0, b"", true);
        h.settle();

        assert_eq!(h.sent_on(0), vec![(Bytes::new(), true)]);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let mut context = ctx(Echo);
        context.max_message_size = 4;
        let stats = context.stats.clone();
        let mut h = Harness::new(context, InlineExecutor);

        h.data(0, b"abc", false);
        h.data(0, b"def", false);
        h.data(0, b"ghi", true);
        h.settle();

        assert!(h.sent_on(0).is_empty());
        assert_eq!(
            h.conn.session().resets,
            vec![(StreamId::new(0), protocol::RESET_TOO_LARGE)]
        );
        assert_eq!(stats.snapshot().rejected_streams, 1);
        assert_eq!(h.conn.active_streams(), 0);
    }

    #[test]
    fn test_outcome_after_client_reset_is_discarded() {
        let executor = ParkedExecutor::default();
        let mut h = Harness::new(ctx(Echo), executor.clone());

        h.data(0, b"slow", true);
        h.conn.on_event(
            TransportEvent::StreamReset {
                stream_id: StreamId::new(0),
                code: 0,
            }
            .into(),
        );
        executor.run_all();
        h.settle();

        assert!(h.sent_on(0).is_empty());
        assert_eq!(
            h.conn.session().resets,
            vec![(StreamId::new(0), protocol::RESET_NO_REPLY)]
        );
    }

    #[test]
    fn test_client_reset_releases_idle_stream() {
        let mut h = Harness::new(ctx(Echo), InlineExecutor);

        h.data(0, b"partial", false);
        h.conn.on_event(
            TransportEvent::StreamReset {
                stream_id: StreamId::new(0),
                code: 0,
            }
            .into(),
        );

        assert_eq!(h.conn.active_streams(), 0);
        assert_eq!(
            h.conn.session().resets,
            vec![(StreamId::new(0), protocol::RESET_NO_REPLY)]
        );

        // A reset for a stream that already finished needs no release
        h.data(4, b"done", true);
        h.settle();
        h.conn.on_event(
            TransportEvent::StreamReset {
                stream_id: StreamId::new(4),
                code: 0,
            }
            .into(),
        );
        assert_eq!(h.conn.session().resets.len(), 1);
    }

    #[test]
    fn test_close_waits_for_transport() {
        let mut h = Harness::new(ctx(Echo), InlineExecutor);
        let closed = h.conn.close();

        assert!(h.conn.session().closed.is_some());
        assert!(!closed.is_ready());
        assert!(!h.conn.is_finished());

        h.conn.on_event(
            TransportEvent::ConnectionClosed {
                code: 0,
                reason: "server shutdown".into(),
            }
            .into(),
        );
        assert_eq!(closed.wait(), Ok(()));
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert!(h.conn.is_finished());
    }

    #[test]
    fn test_connection_lost_finishes_loop() {
        let mut h = Harness::new(ctx(Echo), InlineExecutor);
        h.data(0, b"partial", false);
        h.conn.on_event(
            TransportEvent::ConnectionLost {
                reason: "idle timeout".into(),
            }
            .into(),
        );

        assert_eq!(h.conn.state(), ConnectionState::Failed);
        assert_eq!(h.conn.active_streams(), 0);
        assert!(h.conn.is_finished());
    }
}
