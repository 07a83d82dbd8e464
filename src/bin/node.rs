//! Arm Node Application
//!
//! Captures the microphone front-ends and streams raw PCM over HTTP and to
//! the collector.
//!
//! Usage: `node [config.toml]`, or `node --list-devices` with the
//! `cpal-input` feature.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wearable_audio_node::{
    audio::{source::SourceProvider, synthetic::ToneProvider},
    cancel::CancelToken,
    config::{NodeConfig, SourceKind},
    network::forwarder::{Forwarder, TcpConnector},
    video::StaticJpegSource,
    web::{AppState, WebServer},
};

#[cfg(feature = "cpal-input")]
use wearable_audio_node::audio::{capture::CpalProvider, device::list_devices};

fn build_provider(config: &NodeConfig) -> Result<Arc<dyn SourceProvider>> {
    let audio = &config.audio;
    match audio.source {
        SourceKind::Tone => Ok(Arc::new(ToneProvider::new(
            audio.channels as usize,
            audio.sample_rate,
            audio.layout,
            audio.paced,
        ))),
        #[cfg(feature = "cpal-input")]
        SourceKind::Device => {
            let secondary = if audio.channels == 4 {
                audio.secondary_device.clone()
            } else {
                None
            };
            Ok(Arc::new(CpalProvider::new(
                audio.primary_device.clone(),
                secondary,
                audio.sample_rate,
            )))
        }
        #[cfg(not(feature = "cpal-input"))]
        SourceKind::Device => {
            anyhow::bail!("audio.source = \"device\" needs the cpal-input feature")
        }
    }
}

#[cfg(feature = "cpal-input")]
fn print_devices() {
    println!("\n=== Available Input Devices ===");
    for device in list_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
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

    let arg = std::env::args().nth(1);

    #[cfg(feature = "cpal-input")]
    if arg.as_deref() == Some("--list-devices") {
        print_devices();
        return Ok(());
    }

    tracing::info!("Starting arm node");

    let config_path = arg.map(PathBuf::from);
    let config = NodeConfig::load(config_path.as_deref()).context("loading configuration")?;
    tracing::info!(
        "Audio: {} channels at {} Hz, {} frames per buffer ({} byte chunks)",
        config.audio.channels,
        config.audio.sample_rate,
        config.audio.frames_per_buffer,
        config.audio.chunk_bytes()
    );

    let provider = build_provider(&config)?;
    let cancel = CancelToken::new();

    // Persistent collector stream
    let mut forwarder_stats = None;
    let forwarder_handle = if config.forwarder.enabled {
        let addr = config.forwarder.collector_addr()?;
        let connector = TcpConnector::new(addr, config.forwarder.connect_timeout())
            .with_write_timeout(config.forwarder.write_timeout());
        let forwarder = Forwarder::new(
            provider.clone(),
            connector,
            config.audio.clone(),
            config.forwarder.retry.to_policy(),
        );
        forwarder_stats = Some(forwarder.stats());
        tracing::info!("Forwarding to collector at {}", addr);
        Some(forwarder.spawn(cancel.clone())?)
    } else {
        None
    };

    let server_handle = if config.http.enabled {
        let mut state = AppState::new(config.clone(), provider.clone(), cancel.clone());
        if let Some(stats) = forwarder_stats {
            state = state.with_forwarder(stats);
        }
        if let Some(path) = &config.video.jpeg_path {
            let frames = StaticJpegSource::load(path)?;
            state = state.with_video(Arc::new(frames));
            tracing::info!("MJPEG stream on {}", config.http.video_path);
        }

        let server = WebServer::new(Arc::new(state));
        let listener = server.bind().await?;
        tracing::info!(
            "PCM stream at http://{}{}",
            listener.local_addr()?,
            config.http.audio_path
        );

        let shutdown_token = cancel.clone();
        let shutdown = async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            shutdown_token.cancel();
        };
        Some(tokio::spawn(server.serve(listener, shutdown)))
    } else {
        None
    };

    match server_handle {
        Some(handle) => handle.await??,
        None => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested");
            cancel.cancel();
        }
    }

    if let Some(handle) = forwarder_handle {
        tokio::task::spawn_blocking(move || handle.join())
            .await?
            .map_err(|_| anyhow::anyhow!("forwarder thread panicked"))?;
    }

    tracing::info!("Arm node stopped");
    Ok(())
}
