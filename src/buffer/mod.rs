//! Multi-reader stream queue
//!
//! One producer appends immutable chunks at the tail; any number of
//! listeners read at their own pace, each holding a handle to the chunk
//! its cursor sits on. Trimming pops head chunks once nothing but the
//! queue itself references them, so a slow reader is never invalidated
//! out from under it.
//!
//! # Zero-Copy Design
//!
//! Payloads are `bytes::Bytes` and chunks are `Arc<StreamChunk>`, so the
//! queue and every cursor share a single allocation per chunk. "Release"
//! is dropping the handle; a chunk whose `Arc::strong_count` is 1 is owned
//! by the queue alone and is reclaimable.
//!
//! No locking lives here. The owning source serializes all access under
//! its own lock.

pub mod chunk;
pub mod queue;

pub use chunk::StreamChunk;
pub use queue::BufferQueue;
