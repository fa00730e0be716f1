//! Producer seam for a source's ingest loop
//!
//! A producer is anything that yields raw stream bytes: the socket of a
//! relay's upstream connection, or a channel fed by a local encoder
//! process. The ingest loop owns the timeout policy; producers just read.

use std::future::Future;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Source of raw stream bytes
pub trait StreamProducer: Send {
    /// Next blob of bytes; `Ok(None)` is a clean end of stream
    fn read_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Producer fed through an in-process channel
///
/// The sender half lives with a local encoder task; dropping it ends the
/// stream cleanly.
pub struct ChannelProducer {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelProducer {
    /// Channel pair sized for a bursty producer
    pub fn new(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

impl StreamProducer for ChannelProducer {
    fn read_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send {
        async move { Ok(self.rx.recv().await) }
    }
}

/// Producer reading an upstream socket
///
/// Carries any bytes that arrived glued to the upstream's response
/// headers so nothing at the front of the stream is lost.
pub struct SocketProducer {
    stream: TcpStream,
    leftover: Option<Bytes>,
    read_size: usize,
}

impl SocketProducer {
    /// Wrap an upstream connection
    pub fn new(stream: TcpStream, leftover: Bytes) -> Self {
        Self {
            stream,
            leftover: if leftover.is_empty() {
                None
            } else {
                Some(leftover)
            },
            read_size: 4096,
        }
    }
}

impl StreamProducer for SocketProducer {
    fn read_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send {
        async move {
            if let Some(leftover) = self.leftover.take() {
                return Ok(Some(leftover));
            }
            let mut buf = BytesMut::with_capacity(self.read_size);
            let n = self.stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(buf.freeze()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_producer_ends_on_sender_drop() {
        tokio_test::block_on(async {
            let (tx, mut producer) = ChannelProducer::new(4);
            tx.send(Bytes::from_static(b"data")).await.unwrap();
            drop(tx);

            assert_eq!(
                producer.read_chunk().await.unwrap().as_deref(),
                Some(&b"data"[..])
            );
            assert!(producer.read_chunk().await.unwrap().is_none());
        });
    }
}
