/// Accumulation buffer for one in-flight stream
///
/// Bytes are appended in the order the transport delivers them. Once the
/// peer signals the end of the stream the buffer is terminated and accepts
/// no further data.
use bytes::{Bytes, BytesMut};

/// Ordered bytes of one logical stream plus its termination flag
#[derive(Debug)]
pub struct StreamBuffer {
    data: BytesMut,
    terminated: bool,
    limit: usize,
}

impl StreamBuffer {
    /// Create an empty buffer that refuses to grow past `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            terminated: false,
            limit,
        }
    }

    /// Append a chunk received from the transport
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferError> {
        if self.terminated {
            return Err(BufferError::Terminated);
        }

        let size = self.data.len() + chunk.len();
        if size > self.limit {
            return Err(BufferError::Overflow {
                size,
                limit: self.limit,
            });
        }

        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Mark that the peer will send nothing more on this stream
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the buffer, yielding everything accumulated so far
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

/// Buffer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Stream already terminated")]
    Terminated,

    #[error("Message too large: {size} bytes (max {limit})")]
    Overflow { size: usize, limit: usize },
}
