/// Per-stream pumps between quinn streams and the loop thread
///
/// Each open stream gets one writer task draining a command queue into the
/// quinn send half and one reader task turning the receive half into
/// `TransportEvent::StreamData` events.
use super::TransportEvent;
use crate::scheduler::EventSender;
use bytes::Bytes;
use quicmux_common::StreamId;
use quinn::{ReadError, RecvStream, SendStream, VarInt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Largest chunk handed to the loop in one event
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Work queued for a stream's writer task
#[derive(Debug)]
pub(crate) enum WriteCommand {
    Data { data: Bytes, end_stream: bool },
    Reset(u32),
}

pub(crate) type WriteQueue = mpsc::UnboundedSender<WriteCommand>;

/// Drain `commands` into `send` until the stream is finished or reset
pub(crate) async fn pump_writes<E>(
    stream_id: StreamId,
    mut send: SendStream,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    events: EventSender<E>,
) where
    E: From<TransportEvent> + Send + 'static,
{
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Data { data, end_stream } => {
                if !data.is_empty() {
                    if let Err(e) = send.write_chunk(data).await {
                        report_write_error(stream_id, e, &events);
                        return;
                    }
                }
                if end_stream {
                    if let Err(e) = send.finish() {
                        debug!("Stream {} already closed: {}", stream_id, e);
                    }
                    return;
                }
            }
            WriteCommand::Reset(code) => {
                trace!("Resetting stream {} with code {}", stream_id, code);
                let _ = send.reset(VarInt::from_u32(code));
                return;
            }
        }
    }
}

fn report_write_error<E>(stream_id: StreamId, error: quinn::WriteError, events: &EventSender<E>)
where
    E: From<TransportEvent> + Send + 'static,
{
    match error {
        quinn::WriteError::Stopped(code) => {
            events.emit(TransportEvent::StreamReset {
                stream_id,
                code: code.into_inner(),
            });
        }
        // Connection-level failures are reported once by the connection watcher
        other => debug!("Write on stream {} failed: {}", stream_id, other),
    }
}

/// Forward every chunk of `recv` to the loop, then an empty end-of-stream marker
pub(crate) async fn pump_reads<E>(stream_id: StreamId, mut recv: RecvStream, events: EventSender<E>)
where
    E: From<TransportEvent> + Send + 'static,
{
    loop {
        match recv.read_chunk(READ_CHUNK_SIZE, true).await {
            Ok(Some(chunk)) => {
                let delivered = events.emit(TransportEvent::StreamData {
                    stream_id,
                    data: chunk.bytes,
                    end_stream: false,
                });
                if !delivered {
                    return;
                }
            }
            Ok(None) => {
                events.emit(TransportEvent::StreamData {
                    stream_id,
                    data: Bytes::new(),
                    end_stream: true,
                });
                return;
            }
            Err(ReadError::Reset(code)) => {
                events.emit(TransportEvent::StreamReset {
                    stream_id,
                    code: code.into_inner(),
                });
                return;
            }
            Err(e) => {
                debug!("Read on stream {} ended: {}", stream_id, e);
                return;
            }
        }
    }
}
