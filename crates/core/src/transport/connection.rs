use super::stream::{self, WriteCommand, WriteQueue};
use super::{Session, TransportError, TransportEvent};
use crate::scheduler::EventSender;
use bytes::Bytes;
use quicmux_common::{StreamId, STREAM_ID_STEP};
use quinn::{Connection, ConnectionError, Endpoint, VarInt};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::spawn_local;
use tracing::{debug, info, warn};

/// How long a closing client waits for the close frame to leave
const CLOSE_LINGER: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Shared {
    connection: Option<Connection>,
    writers: HashMap<StreamId, WriteQueue>,
    unopened: HashSet<StreamId>,
    next_local: StreamId,
    closed: bool,
}

/// `Session` backed by a quinn connection
///
/// Lives on a scheduler's loop thread. Stream I/O runs in local tasks that
/// report back through the loop's event queue.
pub struct QuicSession<E> {
    shared: Rc<RefCell<Shared>>,
    events: EventSender<E>,
    linger: Option<Endpoint>,
    peer: SocketAddr,
}

impl<E> QuicSession<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    /// Start the handshake to `remote`; `HandshakeCompleted` or
    /// `ConnectionLost` follows as an event.
    ///
    /// Must run on the loop thread.
    pub fn connect(
        endpoint: Endpoint,
        remote: SocketAddr,
        server_name: &str,
        events: EventSender<E>,
    ) -> Result<Self, TransportError> {
        let connecting = endpoint
            .connect(remote, server_name)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let shared = Rc::new(RefCell::new(Shared::default()));
        debug!("Connecting to {} as {}", remote, server_name);

        let task_shared = shared.clone();
        let task_events = events.clone();
        spawn_local(async move {
            let connection = match connecting.await {
                Ok(connection) => connection,
                Err(e) => {
                    task_events.emit(TransportEvent::ConnectionLost {
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            {
                let mut shared = task_shared.borrow_mut();
                if shared.closed {
                    connection.close(VarInt::from_u32(0), b"closed during handshake");
                    return;
                }
                shared.connection = Some(connection.clone());
            }

            info!("Connected to {}", connection.remote_address());
            task_events.emit(TransportEvent::HandshakeCompleted);
            watch_connection(connection, task_events).await;
        });

        Ok(Self {
            shared,
            events,
            linger: Some(endpoint),
            peer: remote,
        })
    }

    /// Wrap a connection accepted by a server endpoint
    ///
    /// Emits `HandshakeCompleted` right away and starts accepting the
    /// peer's streams. Must run on the loop thread.
    pub fn accepted(connection: Connection, events: EventSender<E>) -> Self {
        let peer = connection.remote_address();
        let shared = Rc::new(RefCell::new(Shared {
            connection: Some(connection.clone()),
            ..Shared::default()
        }));

        events.emit(TransportEvent::HandshakeCompleted);
        spawn_local(accept_streams(connection.clone(), shared.clone(), events.clone()));
        spawn_local(watch_connection(connection, events.clone()));

        Self {
            shared,
            events,
            linger: None,
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl<E> Session for QuicSession<E>
where
    E: From<TransportEvent> + Send + 'static,
{
    fn next_stream_id(&mut self) -> StreamId {
        let mut shared = self.shared.borrow_mut();
        let stream_id = shared.next_local;
        shared.next_local = stream_id.next();
        shared.unopened.insert(stream_id);
        stream_id
    }

    fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Err(TransportError::NotConnected);
        }

        if let Some(queue) = shared.writers.get(&stream_id) {
            queue
                .send(WriteCommand::Data { data, end_stream })
                .map_err(|_| TransportError::UnknownStream(stream_id))?;
            if end_stream {
                shared.writers.remove(&stream_id);
            }
            return Ok(());
        }

        if !shared.unopened.remove(&stream_id) {
            return Err(TransportError::UnknownStream(stream_id));
        }
        let connection = shared
            .connection
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let (queue, commands) = mpsc::unbounded_channel();
        let _ = queue.send(WriteCommand::Data { data, end_stream });
        if !end_stream {
            shared.writers.insert(stream_id, queue);
        }
        drop(shared);

        spawn_local(open_stream(
            connection,
            stream_id,
            commands,
            self.events.clone(),
        ));
        Ok(())
    }

    fn reset_stream(&mut self, stream_id: StreamId, code: u32) -> Result<(), TransportError> {
        let mut shared = self.shared.borrow_mut();
        if shared.unopened.remove(&stream_id) {
            // Never reached the wire
            return Ok(());
        }

        let queue = shared
            .writers
            .remove(&stream_id)
            .ok_or(TransportError::UnknownStream(stream_id))?;
        let _ = queue.send(WriteCommand::Reset(code));
        Ok(())
    }

    fn close(&mut self, code: u32, reason: &str) {
        let connection = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.writers.clear();
            shared.unopened.clear();
            shared.connection.clone()
        };

        let events = self.events.clone();
        let reason = reason.to_string();
        let Some(connection) = connection else {
            events.emit(TransportEvent::ConnectionClosed {
                code: code.into(),
                reason,
            });
            return;
        };

        debug!("Closing connection to {}: {}", self.peer, reason);
        connection.close(VarInt::from_u32(code), reason.as_bytes());

        let linger = self.linger.clone();
        spawn_local(async move {
            if let Some(endpoint) = linger {
                let _ = tokio::time::timeout(CLOSE_LINGER, endpoint.wait_idle()).await;
            }
            events.emit(TransportEvent::ConnectionClosed {
                code: code.into(),
                reason,
            });
        });
    }
}

async fn open_stream<E>(
    connection: Connection,
    stream_id: StreamId,
    commands: mpsc::UnboundedReceiver<WriteCommand>,
    events: EventSender<E>,
) where
    E: From<TransportEvent> + Send + 'static,
{
    match connection.open_bi().await {
        Ok((send, recv)) => {
            spawn_local(stream::pump_reads(stream_id, recv, events.clone()));
            stream::pump_writes(stream_id, send, commands, events).await;
        }
        Err(e) => debug!("Failed to open stream {}: {}", stream_id, e),
    }
}

async fn accept_streams<E>(connection: Connection, shared: Rc<RefCell<Shared>>, events: EventSender<E>)
where
    E: From<TransportEvent> + Send + 'static,
{
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!("Stopped accepting streams from {}: {}", connection.remote_address(), e);
                return;
            }
        };

        // Only peer-initiated bidirectional streams arrive here
        let stream_id = StreamId::new(send.id().index() * STREAM_ID_STEP);
        let (queue, commands) = mpsc::unbounded_channel();
        shared.borrow_mut().writers.insert(stream_id, queue);

        spawn_local(stream::pump_writes(stream_id, send, commands, events.clone()));
        spawn_local(stream::pump_reads(stream_id, recv, events.clone()));
    }
}

async fn watch_connection<E>(connection: Connection, events: EventSender<E>)
where
    E: From<TransportEvent> + Send + 'static,
{
    let event = match connection.closed().await {
        ConnectionError::LocallyClosed => return,
        ConnectionError::ApplicationClosed(close) => {
            info!("Peer {} closed the connection", connection.remote_address());
            TransportEvent::ConnectionClosed {
                code: close.error_code.into_inner(),
                reason: String::from_utf8_lossy(&close.reason).into_owned(),
            }
        }
        other => {
            warn!("Connection to {} lost: {}", connection.remote_address(), other);
            TransportEvent::ConnectionLost {
                reason: other.to_string(),
            }
        }
    };
    events.emit(event);
}
