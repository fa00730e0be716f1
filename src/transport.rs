//! Listener transport seam
//!
//! The fan-out never blocks: a transport either accepts bytes now or
//! reports `WouldBlock`, in which case the listener simply waits for the
//! next tick. The actual protocol spoken over the connection (HTTP
//! response framing, TLS, ...) is the caller's business.

use std::io;

use tokio::net::TcpStream;

/// Why a non-blocking write made no progress
#[derive(Debug)]
pub enum TransportError {
    /// The peer can't accept data right now; retry next tick
    WouldBlock,
    /// The connection is gone for good
    Closed(io::Error),
}

/// Non-blocking byte sink for one connected listener
pub trait ListenerTransport: Send {
    /// Write as many bytes as the transport will take without blocking
    ///
    /// Returns the number of bytes accepted (possibly fewer than
    /// `data.len()`).
    fn try_write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Drop the connection; further writes will fail
    fn close(&mut self) {}

    /// Short label for logging (peer address where known)
    fn peer_label(&self) -> String {
        "-".to_string()
    }
}

/// Transport over a tokio TCP stream
///
/// Uses `TcpStream::try_write`, mapping `WouldBlock` so the fan-out can
/// skip the listener until its socket drains.
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "-".to_string());
        Self { stream, peer }
    }
}

impl ListenerTransport for TcpTransport {
    fn try_write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match self.stream.try_write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(e) => Err(TransportError::Closed(e)),
        }
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

/// In-memory transport for tests and demos
///
/// Accepts up to `capacity_per_write` bytes per call and records
/// everything written. Can be scripted to block or fail.
#[derive(Debug, Default)]
pub struct SinkTransport {
    /// Everything successfully written
    pub written: Vec<u8>,
    /// Per-call acceptance cap (0 = unlimited)
    pub capacity_per_write: usize,
    /// When true, every write reports `WouldBlock`
    pub blocked: bool,
    /// When true, every write reports a closed connection
    pub broken: bool,
}

impl SinkTransport {
    /// Unlimited sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that accepts at most `cap` bytes per write call
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            capacity_per_write: cap,
            ..Self::default()
        }
    }

    /// Sink whose writes always report `WouldBlock`
    pub fn always_blocked() -> Self {
        Self {
            blocked: true,
            ..Self::default()
        }
    }
}

impl ListenerTransport for SinkTransport {
    fn try_write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.broken {
            return Err(TransportError::Closed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sink broken",
            )));
        }
        if self.blocked {
            return Err(TransportError::WouldBlock);
        }
        let n = if self.capacity_per_write == 0 {
            data.len()
        } else {
            data.len().min(self.capacity_per_write)
        };
        if n == 0 {
            return Err(TransportError::WouldBlock);
        }
        self.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.broken = true;
    }

    fn peer_label(&self) -> String {
        "sink".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_respects_capacity() {
        let mut sink = SinkTransport::with_capacity(4);
        assert_eq!(sink.try_write(b"abcdef").unwrap(), 4);
        assert_eq!(sink.written, b"abcd");
    }

    #[test]
    fn test_blocked_sink_reports_would_block() {
        let mut sink = SinkTransport::always_blocked();
        assert!(matches!(
            sink.try_write(b"xy"),
            Err(TransportError::WouldBlock)
        ));
    }

    #[test]
    fn test_closed_sink_reports_closed() {
        let mut sink = SinkTransport::new();
        sink.close();
        assert!(matches!(
            sink.try_write(b"xy"),
            Err(TransportError::Closed(_))
        ));
    }
}
