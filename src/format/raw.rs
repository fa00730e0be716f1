//! Raw pass-through format
//!
//! Frames producer bytes into fixed-target chunks without inspecting
//! them. Every chunk is a sync point, which matches codec-agnostic byte
//! streams where any position is as good as another.

use bytes::{Bytes, BytesMut};

use crate::buffer::StreamChunk;
use crate::transport::{ListenerTransport, TransportError};

use super::{FormatPlugin, StreamUnit};

/// Default framing target in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Pass-through chunker
#[derive(Debug)]
pub struct RawFormat {
    chunk_size: usize,
    pending_metadata: Option<Bytes>,
}

impl RawFormat {
    /// Raw format with the default chunk target
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Raw format framing units of up to `chunk_size` bytes
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pending_metadata: None,
        }
    }

    /// Attach a metadata update to the next framed unit
    ///
    /// Out-of-band title updates from the producer side end up riding the
    /// queue alongside the audio they belong with.
    pub fn set_metadata(&mut self, metadata: Bytes) {
        self.pending_metadata = Some(metadata);
    }
}

impl Default for RawFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatPlugin for RawFormat {
    fn frame_next(&mut self, buf: &mut BytesMut) -> Option<StreamUnit> {
        if buf.len() < self.chunk_size {
            return None;
        }
        let data = buf.split_to(self.chunk_size).freeze();
        Some(StreamUnit {
            data,
            sync_point: true,
            metadata: self.pending_metadata.take(),
        })
    }

    fn frame_flush(&mut self, buf: &mut BytesMut) -> Option<StreamUnit> {
        if buf.is_empty() {
            return None;
        }
        let data = buf.split().freeze();
        Some(StreamUnit {
            data,
            sync_point: true,
            metadata: self.pending_metadata.take(),
        })
    }

    fn serialize(
        &mut self,
        chunk: &StreamChunk,
        from: usize,
        transport: &mut dyn ListenerTransport,
    ) -> Result<usize, TransportError> {
        let remaining = &chunk.data[from..];
        if remaining.is_empty() {
            return Ok(0);
        }
        transport.try_write(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SinkTransport;

    #[test]
    fn test_frames_at_chunk_size() {
        let mut fmt = RawFormat::with_chunk_size(4);
        let mut buf = BytesMut::from(&b"abcdefghij"[..]);

        let a = fmt.frame_next(&mut buf).unwrap();
        let b = fmt.frame_next(&mut buf).unwrap();
        assert_eq!(&a.data[..], b"abcd");
        assert_eq!(&b.data[..], b"efgh");
        assert!(a.sync_point && b.sync_point);

        // two bytes left, below the target
        assert!(fmt.frame_next(&mut buf).is_none());
        let tail = fmt.frame_flush(&mut buf).unwrap();
        assert_eq!(&tail.data[..], b"ij");
    }

    #[test]
    fn test_metadata_rides_next_unit() {
        let mut fmt = RawFormat::with_chunk_size(2);
        fmt.set_metadata(Bytes::from_static(b"title=x"));
        let mut buf = BytesMut::from(&b"aabb"[..]);

        let first = fmt.frame_next(&mut buf).unwrap();
        assert_eq!(first.metadata.as_deref(), Some(&b"title=x"[..]));
        let second = fmt.frame_next(&mut buf).unwrap();
        assert!(second.metadata.is_none());
    }

    #[test]
    fn test_serialize_honors_offset_and_partial_write() {
        let mut fmt = RawFormat::new();
        let chunk = StreamChunk {
            seq: 0,
            data: Bytes::from_static(b"0123456789"),
            sync_point: true,
            metadata: None,
        };
        let mut sink = SinkTransport::with_capacity(3);
        let n = fmt.serialize(&chunk, 4, &mut sink).unwrap();
        assert_eq!(n, 3);
        assert_eq!(sink.written, b"456");
    }
}
