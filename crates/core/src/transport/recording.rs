//! In-memory session used to drive the loop-side state machines in tests.

use super::{Session, TransportError};
use bytes::Bytes;
use quicmux_common::StreamId;

#[derive(Debug, Default)]
pub(crate) struct RecordingSession {
    pub next: StreamId,
    pub allocated: usize,
    pub sent: Vec<(StreamId, Bytes, bool)>,
    pub resets: Vec<(StreamId, u32)>,
    pub closed: Option<(u32, String)>,
    pub refuse_sends: bool,
}

impl RecordingSession {
    pub fn sent_on(&self, stream_id: StreamId) -> Vec<(Bytes, bool)> {
        self.sent
            .iter()
            .filter(|(id, _, _)| *id == stream_id)
            .map(|(_, data, end)| (data.clone(), *end))
            .collect()
    }
}

impl Session for RecordingSession {
    fn next_stream_id(&mut self) -> StreamId {
        let id = self.next;
        self.next = id.next();
        self.allocated += 1;
        id
    }

    fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        if self.refuse_sends || self.closed.is_some() {
            return Err(TransportError::NotConnected);
        }
        self.sent.push((stream_id, data, end_stream));
        Ok(())
    }

    fn reset_stream(&mut self, stream_id: StreamId, code: u32) -> Result<(), TransportError> {
        self.resets.push((stream_id, code));
        Ok(())
    }

    fn close(&mut self, code: u32, reason: &str) {
        self.closed.get_or_insert((code, reason.to_string()));
    }
}
