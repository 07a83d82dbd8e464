//! Collector Application
//!
//! Accepts forwarder connections, validates the stream header and reports
//! throughput. Optionally appends the raw PCM to a file.
//!
//! Usage: `collector [bind_addr] [output.raw]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wearable_audio_node::network::protocol::StreamHeader;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut raw = [0u8; StreamHeader::SIZE];
    stream
        .read_exact(&mut raw)
        .await
        .context("reading stream header")?;
    let header = StreamHeader::decode(&raw)?;
    tracing::info!(
        "{}: {} channels, {} bits, {} Hz ({} bytes/s expected)",
        peer,
        header.channels,
        header.bits_per_sample,
        header.sample_rate,
        header.byte_rate()
    );

    let mut file = match output {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => None,
    };

    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    let mut window: u64 = 0;
    let mut window_start = Instant::now();

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        window += n as u64;

        if let Some(file) = file.as_mut() {
            file.write_all(&buf[..n]).await?;
        }

        // Periodic stats
        let elapsed = window_start.elapsed();
        if elapsed >= STATS_INTERVAL {
            let rate = window as f64 / elapsed.as_secs_f64();
            tracing::info!(
                "{}: {:.0} bytes/s ({:.1}% of nominal), {:.1} KB total",
                peer,
                rate,
                rate * 100.0 / header.byte_rate() as f64,
                total as f64 / 1024.0
            );
            window = 0;
            window_start = Instant::now();
        }
    }

    if let Some(mut file) = file {
        file.flush().await?;
    }
    tracing::info!("{}: stream closed after {} bytes", peer, total);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let bind_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "0.0.0.0:1001".to_string())
        .parse()
        .context("invalid bind address")?;
    let output = args.next().map(PathBuf::from);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    tracing::info!("Collector listening on {}", bind_addr);
    if let Some(path) = &output {
        tracing::info!("Appending PCM to {}", path.display());
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::info!("Node connected from {}", peer);
                let output = output.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, output).await {
                        tracing::warn!("{}: {:#}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Collector stopped");
                return Ok(());
            }
        }
    }
}
