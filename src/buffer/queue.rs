//! Queue implementation
//!
//! A `VecDeque` of shared chunk handles plus a monotonic sequence base.
//! Cursor positions are sequence numbers, so lookups stay O(1) while the
//! head moves.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use super::chunk::StreamChunk;

/// Append-at-tail, trim-at-head queue of shared stream chunks
#[derive(Debug, Default)]
pub struct BufferQueue {
    chunks: VecDeque<Arc<StreamChunk>>,
    next_seq: u64,
    bytes: usize,
}

impl BufferQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new chunk at the tail
    ///
    /// This is the sole creation path for chunks. The queue keeps one
    /// handle; the returned handle belongs to the caller.
    pub fn append(
        &mut self,
        data: Bytes,
        sync_point: bool,
        metadata: Option<Bytes>,
    ) -> Arc<StreamChunk> {
        let chunk = Arc::new(StreamChunk {
            seq: self.next_seq,
            data,
            sync_point,
            metadata,
        });
        self.next_seq += 1;
        self.bytes += chunk.len();
        self.chunks.push_back(Arc::clone(&chunk));
        chunk
    }

    /// Look up a chunk by sequence number
    ///
    /// Returns `None` if the chunk was already trimmed or not yet
    /// appended.
    pub fn get(&self, seq: u64) -> Option<Arc<StreamChunk>> {
        let head = self.head_seq()?;
        if seq < head {
            return None;
        }
        self.chunks.get((seq - head) as usize).map(Arc::clone)
    }

    /// Sequence number of the oldest chunk still queued
    pub fn head_seq(&self) -> Option<u64> {
        self.chunks.front().map(|c| c.seq)
    }

    /// Sequence number of the newest chunk
    pub fn tail_seq(&self) -> Option<u64> {
        self.chunks.back().map(|c| c.seq)
    }

    /// Sequence number the next appended chunk will get
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Total queued payload bytes
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the queue holds no chunks
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Reclaim head chunks nothing else references
    ///
    /// Pops from the head while the front chunk sits before `burst_seq`
    /// and the queue holds the only handle to it. Stops at the first chunk
    /// still referenced by a listener cursor or marking the burst window,
    /// so a reader is never invalidated. Returns the number of payload
    /// bytes released.
    pub fn trim(&mut self, burst_seq: u64) -> usize {
        let mut released = 0;
        loop {
            let reclaimable = self
                .chunks
                .front()
                .is_some_and(|front| front.seq < burst_seq && Arc::strong_count(front) == 1);
            if !reclaimable {
                break;
            }
            if let Some(chunk) = self.chunks.pop_front() {
                self.bytes -= chunk.len();
                released += chunk.len();
            }
        }
        released
    }

    /// Drop every chunk regardless of external handles
    ///
    /// Listeners still holding cursors keep their own handles alive; the
    /// queue simply forgets them. Used when a source is cleared.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![0xAAu8; len])
    }

    #[test]
    fn test_append_assigns_sequential_seqs() {
        let mut q = BufferQueue::new();
        let a = q.append(payload(10), true, None);
        let b = q.append(payload(20), false, None);
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
        assert_eq!(q.len_bytes(), 30);
        assert_eq!(q.head_seq(), Some(0));
        assert_eq!(q.tail_seq(), Some(1));
    }

    #[test]
    fn test_get_by_seq_after_head_moved() {
        let mut q = BufferQueue::new();
        for _ in 0..4 {
            q.append(payload(8), true, None);
        }
        // release every handle we took, then trim past the first two
        assert_eq!(q.trim(2), 16);
        assert!(q.get(0).is_none());
        assert!(q.get(1).is_none());
        assert_eq!(q.get(2).map(|c| c.seq), Some(2));
        assert_eq!(q.get(3).map(|c| c.seq), Some(3));
        assert!(q.get(4).is_none());
    }

    #[test]
    fn test_trim_stops_at_referenced_chunk() {
        let mut q = BufferQueue::new();
        q.append(payload(8), true, None);
        let cursor = q.append(payload(8), true, None);
        q.append(payload(8), true, None);

        // burst allows everything, but the cursor pins chunk 1
        let released = q.trim(u64::MAX);
        assert_eq!(released, 8);
        assert_eq!(q.head_seq(), Some(1));

        drop(cursor);
        // burst pointer still guards the tail
        q.trim(2);
        assert_eq!(q.head_seq(), Some(2));
    }

    #[test]
    fn test_trim_never_crosses_burst_pointer() {
        let mut q = BufferQueue::new();
        for _ in 0..3 {
            q.append(payload(8), true, None);
        }
        q.trim(0);
        assert_eq!(q.len(), 3, "burst at head, nothing reclaimable");
        q.trim(2);
        assert_eq!(q.head_seq(), Some(2));
    }

    #[test]
    fn test_payload_shared_not_copied() {
        let mut q = BufferQueue::new();
        let data = payload(1024);
        let chunk = q.append(data.clone(), true, None);
        // same allocation: Bytes clone is refcounted
        assert_eq!(chunk.data.as_ptr(), data.as_ptr());
    }

    #[test]
    fn test_clear_keeps_external_handles_valid() {
        let mut q = BufferQueue::new();
        let held = q.append(payload(16), true, None);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.len_bytes(), 0);
        assert_eq!(held.len(), 16);
    }
}
