//! Immutable stream chunks

use bytes::Bytes;

/// One immutable unit of stream data
///
/// Created only by [`BufferQueue::append`](super::BufferQueue::append).
/// Once linked into a queue the payload never changes; only ownership
/// (handle count) does.
#[derive(Debug)]
pub struct StreamChunk {
    /// Monotonic position in the owning queue
    pub seq: u64,
    /// Chunk payload (zero-copy via reference counting)
    pub data: Bytes,
    /// Whether a listener may safely begin reading at this chunk
    pub sync_point: bool,
    /// Optional associated metadata unit (e.g. a title update), shared by
    /// reference with every listener that reads past this chunk
    pub metadata: Option<Bytes>,
}

impl StreamChunk {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
