/// Connection acceptor
///
/// Owns the quinn server endpoint on its own loop thread and hands every
/// accepted connection to a fresh per-connection scheduler running a
/// `ServerConnection`.
use super::dispatcher::{BlockingExecutor, DispatchContext, ServerConnection, ServerEvent};
use crate::completion::{self, Completion, Resolver};
use crate::scheduler::{EventSender, LoopState, Scheduler};
use crate::transport::QuicSession;
use quicmux_common::{protocol, Result};
use quinn::{Connection, Endpoint, VarInt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::spawn_local;
use tracing::{debug, info, warn};

/// How long the endpoint may take to flush close frames on shutdown
const ENDPOINT_LINGER: Duration = Duration::from_millis(200);

pub(crate) type ConnectionLoop = Scheduler<ServerConnection<QuicSession<ServerEvent>, BlockingExecutor>>;

#[derive(Debug)]
pub(crate) enum ListenerEvent {
    Accepted(Connection),
    EndpointIdle,
}

pub(crate) struct Listener {
    endpoint: Endpoint,
    ctx: DispatchContext,
    connections: Vec<ConnectionLoop>,
    next_connection: u64,
    accepting: bool,
    endpoint_closed: bool,
    idle_waiters: Vec<Resolver<()>>,
    idle: bool,
}

impl Listener {
    /// Start accepting on `endpoint`. Must run on the loop thread.
    pub(crate) fn new(endpoint: Endpoint, ctx: DispatchContext, events: EventSender<ListenerEvent>) -> Self {
        spawn_local(accept_connections(endpoint.clone(), events));

        Self {
            endpoint,
            ctx,
            connections: Vec::new(),
            next_connection: 0,
            accepting: true,
            endpoint_closed: false,
            idle_waiters: Vec::new(),
            idle: false,
        }
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Drop loops whose connection already ended
    fn reap(&mut self) {
        let before = self.connections.len();
        self.connections.retain(|connection| connection.is_running());
        let reaped = before - self.connections.len();
        if reaped > 0 {
            debug!("Reaped {} finished connection loops", reaped);
        }
    }

    pub(crate) fn connection_count(&mut self) -> usize {
        self.reap();
        self.connections.len()
    }

    /// Stop accepting and hand over the live connection loops for shutdown
    pub(crate) fn stop_accepting(&mut self) -> Vec<ConnectionLoop> {
        self.accepting = false;
        self.endpoint.set_server_config(None);
        self.reap();
        std::mem::take(&mut self.connections)
    }

    /// Close the endpoint; resolves once pending close frames were flushed
    pub(crate) fn close_endpoint(&mut self) -> Completion<()> {
        if self.idle {
            return Completion::ready(Ok(()));
        }

        let (resolver, completion) = completion::pair();
        self.idle_waiters.push(resolver);
        self.accepting = false;
        if !self.endpoint_closed {
            self.endpoint_closed = true;
            self.endpoint
                .close(VarInt::from_u32(protocol::CLOSE_CODE_OK), b"server shutdown");
        }
        completion
    }

    fn on_accepted(&mut self, connection: Connection) {
        self.reap();
        if !self.accepting {
            connection.close(VarInt::from_u32(protocol::CLOSE_CODE_OK), b"server shutdown");
            return;
        }

        let peer = connection.remote_address();
        let id = self.next_connection;
        self.next_connection += 1;

        let scheduler = Scheduler::new(format!("server-conn-{}", id));
        let ctx = self.ctx.clone();
        let started = scheduler.start(move |events: EventSender<ServerEvent>| {
            let session = QuicSession::accepted(connection, events.clone());
            Ok(ServerConnection::new(session, ctx, BlockingExecutor, events))
        });

        match started {
            Ok(()) => {
                info!("Accepted connection {} from {}", id, peer);
                self.ctx.stats.connection_accepted();
                self.connections.push(scheduler);
            }
            Err(e) => warn!("Failed to start loop for connection from {}: {}", peer, e),
        }
    }
}

impl LoopState for Listener {
    type Event = ListenerEvent;

    fn on_event(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Accepted(connection) => self.on_accepted(connection),
            ListenerEvent::EndpointIdle => {
                self.idle = true;
                for waiter in self.idle_waiters.drain(..) {
                    waiter.succeed(());
                }
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.idle
    }

    fn on_stop(&mut self) {
        for connection in self.connections.drain(..) {
            connection.stop();
        }
        if !self.endpoint_closed {
            self.endpoint
                .close(VarInt::from_u32(protocol::CLOSE_CODE_OK), b"server stopped");
        }
    }
}

async fn accept_connections(endpoint: Endpoint, events: EventSender<ListenerEvent>) {
    while let Some(incoming) = endpoint.accept().await {
        let events = events.clone();
        spawn_local(async move {
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(connection) => {
                    events.emit(ListenerEvent::Accepted(connection));
                }
                Err(e) => debug!("Handshake with {} failed: {}", remote, e),
            }
        });
    }

    let _ = tokio::time::timeout(ENDPOINT_LINGER, endpoint.wait_idle()).await;
    events.emit(ListenerEvent::EndpointIdle);
}

/// Close every connection loop, waiting up to `grace` for each to confirm
pub(crate) fn shutdown_connections(connections: Vec<ConnectionLoop>, grace: Duration) {
    let closing: Vec<(ConnectionLoop, Option<Completion<()>>)> = connections
        .into_iter()
        .map(|connection| {
            let closed = connection.submit(|conn| conn.close()).wait().ok();
            (connection, closed)
        })
        .collect();

    for (connection, closed) in closing {
        if let Some(closed) = closed {
            if closed.wait_timeout(grace).is_err() {
                debug!("Connection loop {} did not confirm close", connection.name());
            }
        }
        connection.stop();
    }
}
