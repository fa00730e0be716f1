//! Connected listener state
//!
//! A listener is one client's position in a source's queue: a transport
//! handle plus a cursor. The cursor holds a handle to exactly one chunk
//! at a time; advancing it drops the old handle, which is what lets the
//! queue reclaim the head behind the slowest reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::buffer::StreamChunk;
use crate::transport::ListenerTransport;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Read position inside the queue
#[derive(Debug)]
pub(crate) struct Cursor {
    /// Chunk the listener is currently draining
    pub chunk: Arc<StreamChunk>,
    /// Byte offset consumed within that chunk
    pub pos: usize,
}

/// One connected client attached to a mountpoint
pub struct Listener {
    /// Unique id, assigned at admission
    pub id: u64,
    pub(crate) transport: Box<dyn ListenerTransport>,
    pub(crate) cursor: Option<Cursor>,
    /// Protocol preamble (HTTP response headers etc.) still being written.
    /// Stream data never starts until this has fully drained.
    pub(crate) preamble: Option<Bytes>,
    pub(crate) preamble_pos: usize,
    /// Offset into file-backed intro content, when the source serves that
    /// instead of a live queue
    pub(crate) intro_offset: Option<usize>,
    /// When the listener was admitted
    pub connected_at: Instant,
    pub(crate) sent_bytes: u64,
}

impl Listener {
    /// Listener with no preamble; stream data starts immediately
    pub fn new(transport: Box<dyn ListenerTransport>) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            cursor: None,
            preamble: None,
            preamble_pos: 0,
            intro_offset: None,
            connected_at: Instant::now(),
            sent_bytes: 0,
        }
    }

    /// Listener that must receive `preamble` before any stream data
    pub fn with_preamble(transport: Box<dyn ListenerTransport>, preamble: Bytes) -> Self {
        let mut listener = Self::new(transport);
        listener.preamble = Some(preamble);
        listener
    }

    /// Whether the preamble is still mid-send
    pub(crate) fn mid_preamble(&self) -> bool {
        self.preamble.is_some()
    }

    /// Forget the queue position (used when moving between mounts; the old
    /// queue's chunks mean nothing on the destination)
    pub(crate) fn clear_cursor(&mut self) {
        self.cursor = None;
        self.intro_offset = None;
    }

    /// Read-only metadata for reporting
    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            peer: self.transport.peer_label(),
            connected_at: self.connected_at,
            sent_bytes: self.sent_bytes,
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("peer", &self.transport.peer_label())
            .field("sent_bytes", &self.sent_bytes)
            .finish()
    }
}

/// Snapshot of one listener for the admin/reporting surface
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    /// Listener id
    pub id: u64,
    /// Transport peer label
    pub peer: String,
    /// Admission time
    pub connected_at: Instant,
    /// Stream bytes delivered so far
    pub sent_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SinkTransport;

    #[test]
    fn test_ids_are_unique() {
        let a = Listener::new(Box::new(SinkTransport::new()));
        let b = Listener::new(Box::new(SinkTransport::new()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_preamble_tracked() {
        let l = Listener::with_preamble(
            Box::new(SinkTransport::new()),
            Bytes::from_static(b"HTTP/1.0 200 OK\r\n\r\n"),
        );
        assert!(l.mid_preamble());
    }
}
