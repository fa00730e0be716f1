//! Minimal local-producer server
//!
//! Run with: cargo run --example local_source [BIND_ADDR]
//!
//! Serves a synthetic byte stream on mountpoint /live. Any TCP client that
//! connects gets a minimal HTTP response head followed by the stream:
//!
//!   curl -s http://localhost:8000/ | xxd | head
//!
//! Late joiners start from the burst window, so playback-style clients get
//! data immediately instead of waiting for fresh bytes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use aircast::config::StaticMountConfig;
use aircast::format::FormatKind;
use aircast::registry::MountRegistry;
use aircast::source::{ChannelProducer, Listener};
use aircast::stats::{ServerStats, StreamEvents};
use aircast::transport::TcpTransport;

const RESPONSE_HEAD: &str =
    "HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aircast=info".parse()?)
                .add_directive("local_source=info".parse()?),
        )
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());

    let stats = Arc::new(ServerStats::new());
    let registry = Arc::new(MountRegistry::new(
        Arc::new(StaticMountConfig::new()),
        Arc::clone(&stats) as Arc<dyn StreamEvents>,
    ));
    let source = registry.reserve("/live").await?;

    // Periodic counter report
    let report_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            tracing::info!(
                sources = report_stats.sources.load(std::sync::atomic::Ordering::Relaxed),
                listeners = report_stats.listeners.load(std::sync::atomic::Ordering::Relaxed),
                total_listeners = report_stats
                    .listener_connections
                    .load(std::sync::atomic::Ordering::Relaxed),
                "Server stats"
            );
        }
    });

    // Acceptor: every connection becomes a listener on /live
    let acceptor_source = Arc::clone(&source);
    let listener_socket = TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Listening for stream clients");
    tokio::spawn(async move {
        loop {
            match listener_socket.accept().await {
                Ok((stream, peer)) => {
                    tracing::info!(peer = %peer, "Client connected");
                    let transport = Box::new(TcpTransport::new(stream));
                    let listener =
                        Listener::with_preamble(transport, Bytes::from_static(RESPONSE_HEAD.as_bytes()));
                    acceptor_source.admit(listener).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            }
        }
    });

    // Synthetic producer: a counter pattern at roughly 64 KiB/s
    let (feed, producer) = ChannelProducer::new(16);
    tokio::spawn(async move {
        let mut counter = 0u8;
        loop {
            let block: Vec<u8> = (0..16 * 1024)
                .map(|i| counter.wrapping_add(i as u8))
                .collect();
            counter = counter.wrapping_add(1);
            if feed.send(Bytes::from(block)).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    });

    source
        .run(&registry, producer, FormatKind::Raw.plugin())
        .await?;
    Ok(())
}
