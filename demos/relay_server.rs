//! Relay pull server
//!
//! Run with: cargo run --example relay_server UPSTREAM_HOST[:PORT] REMOTE_MOUNT
//!
//! Example:
//!   cargo run --example relay_server stream.example.com:8000 /source.ogg
//!
//! Pulls REMOTE_MOUNT from the upstream, serves it locally on /relay at
//! 127.0.0.1:8000, and keeps retrying the upstream whenever the pull
//! drops. The relay is on-demand: the upstream connection is only held
//! while at least one local client is attached.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;

use aircast::config::StaticMountConfig;
use aircast::registry::MountRegistry;
use aircast::relay::{RelayConfig, RelayManager, UpstreamConfig};
use aircast::source::Listener;
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
                .add_directive("relay_server=info".parse()?),
        )
        .init();

    let upstream_arg = std::env::args()
        .nth(1)
        .ok_or("usage: relay_server UPSTREAM_HOST[:PORT] REMOTE_MOUNT")?;
    let remote_mount = std::env::args().nth(2).unwrap_or_else(|| "/".to_string());
    let (host, port) = match upstream_arg.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>()?),
        None => (upstream_arg, 8000),
    };

    let stats = Arc::new(ServerStats::new());
    let registry = Arc::new(MountRegistry::new(
        Arc::new(StaticMountConfig::new()),
        Arc::clone(&stats) as Arc<dyn StreamEvents>,
    ));
    let manager = Arc::new(RelayManager::new(Arc::clone(&registry)));

    // Periodic counter report
    let report_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            tracing::info!(
                listeners = report_stats.listeners.load(std::sync::atomic::Ordering::Relaxed),
                relay_connects = report_stats
                    .relay_connections
                    .load(std::sync::atomic::Ordering::Relaxed),
                "Server stats"
            );
        }
    });

    let mut relay = RelayConfig::new("/relay", UpstreamConfig::new(host, port, remote_mount));
    relay.on_demand = true;
    manager.reconcile(vec![relay]).await;

    // Acceptor: every connection becomes a listener on /relay
    let acceptor_registry = Arc::clone(&registry);
    let listener_socket = TcpListener::bind("127.0.0.1:8000").await?;
    tracing::info!("Serving /relay on 127.0.0.1:8000");
    tokio::spawn(async move {
        loop {
            match listener_socket.accept().await {
                Ok((stream, peer)) => {
                    let transport = Box::new(TcpTransport::new(stream));
                    let listener =
                        Listener::with_preamble(transport, Bytes::from_static(RESPONSE_HEAD.as_bytes()));
                    match acceptor_registry.attach("/relay", listener).await {
                        Ok(source) => {
                            tracing::info!(peer = %peer, mount = %source.mount(), "Client connected");
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Rejecting client");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            }
        }
    });

    manager.run().await;
    Ok(())
}
