//! Format plugin seam
//!
//! The core never looks inside stream data. A format plugin turns raw
//! producer bytes into discrete, queueable units (framing), and knows how
//! to re-serialize a queued chunk for one listener (e.g. interleaving
//! metadata for protocols that want it). Everything codec-specific lives
//! behind this trait.

pub mod raw;

use bytes::{Bytes, BytesMut};

use crate::buffer::StreamChunk;
use crate::transport::{ListenerTransport, TransportError};

pub use raw::RawFormat;

/// One framed unit ready for the queue
#[derive(Debug, Clone)]
pub struct StreamUnit {
    /// Unit payload
    pub data: Bytes,
    /// Whether a listener may start reading at this unit
    pub sync_point: bool,
    /// Metadata update riding along with this unit (e.g. a title change)
    pub metadata: Option<Bytes>,
}

/// Codec-specific framing and serialization
pub trait FormatPlugin: Send {
    /// Frame the next unit out of accumulated producer bytes
    ///
    /// Consumes from `buf`; returns `None` when more bytes are needed.
    fn frame_next(&mut self, buf: &mut BytesMut) -> Option<StreamUnit>;

    /// Flush whatever is buffered as a final (possibly short) unit
    fn frame_flush(&mut self, buf: &mut BytesMut) -> Option<StreamUnit>;

    /// Write chunk data from `from` onward to a listener transport
    ///
    /// Returns the number of *chunk payload* bytes consumed; the plugin
    /// may expand the data on the wire (metadata interleaving) as long as
    /// its own per-listener state tracks that.
    fn serialize(
        &mut self,
        chunk: &StreamChunk,
        from: usize,
        transport: &mut dyn ListenerTransport,
    ) -> Result<usize, TransportError>;
}

/// Which plugin to instantiate for a stream
///
/// Selected from the producer's declared content type. Codecs the core
/// does not understand still stream fine as raw pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// Pass-through chunking, no content inspection
    Raw,
}

impl FormatKind {
    /// Pick a format for a declared content type
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        // Container-aware plugins hook in here; everything ships raw today.
        let _ = content_type;
        FormatKind::Raw
    }

    /// Instantiate the plugin
    pub fn plugin(self) -> Box<dyn FormatPlugin> {
        match self {
            FormatKind::Raw => Box::new(RawFormat::new()),
        }
    }
}
