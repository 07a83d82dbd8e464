//! HTTP API handlers

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::constants::BITS_PER_SAMPLE;
use crate::network::forwarder::ForwarderStatsSnapshot;
use crate::network::session::{AudioSession, SessionStatsSnapshot};
use crate::network::sink::ChannelSink;
use crate::video::mjpeg::{self, MjpegFramer};
use crate::web::server::{AppState, SessionGuard, SessionInfo, StreamKind};

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Format of the streamed PCM
#[derive(serde::Serialize)]
pub struct StreamFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub frames_per_buffer: usize,
    pub chunk_bytes: usize,
}

/// One connected HTTP client
#[derive(serde::Serialize)]
pub struct ClientStatus {
    pub id: Uuid,
    pub kind: StreamKind,
    pub started_at: DateTime<Utc>,
    pub stats: Option<SessionStatsSnapshot>,
}

/// Node status
#[derive(serde::Serialize)]
pub struct NodeStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub format: StreamFormat,
    pub clients: Vec<ClientStatus>,
    pub forwarder: Option<ForwarderStatsSnapshot>,
}

/// Get node status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<NodeStatus>> {
    let audio = &state.config.audio;
    let clients = state
        .sessions
        .iter()
        .map(|entry| ClientStatus {
            id: *entry.key(),
            kind: entry.kind,
            started_at: entry.started_at,
            stats: entry.stats.as_ref().map(|s| s.snapshot()),
        })
        .collect();

    let status = NodeStatus {
        started_at: state.started_at,
        uptime_seconds: state.uptime_seconds(),
        format: StreamFormat {
            channels: audio.channels,
            sample_rate: audio.sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
            frames_per_buffer: audio.frames_per_buffer,
            chunk_bytes: audio.chunk_bytes(),
        },
        clients,
        forwarder: state.forwarder.as_ref().map(|f| f.snapshot()),
    };

    Json(ApiResponse::ok(status))
}

/// Body that yields every chunk received on `rx`
fn channel_body(rx: mpsc::Receiver<Bytes>) -> Body {
    Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
    }))
}

/// Chunked raw PCM stream.
///
/// Each client gets its own source and double buffer. The session runs on
/// a blocking thread and hands whole buffers to the body through a
/// single-slot channel, so a slow client stalls only its own capture.
pub async fn audio_stream(State(state): State<Arc<AppState>>) -> Response {
    let audio = state.config.audio.clone();
    let provider = state.provider.clone();
    let opened =
        tokio::task::spawn_blocking(move || AudioSession::open(provider.as_ref(), &audio)).await;

    let mut session = match opened {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            tracing::warn!("Audio session setup failed: {}", e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::<()>::error(e.to_string())),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Audio session setup task failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error("session setup failed")),
            )
                .into_response();
        }
    };

    let guard = SessionGuard::register(
        state.clone(),
        session.id(),
        SessionInfo {
            kind: StreamKind::Audio,
            started_at: Utc::now(),
            stats: Some(session.stats()),
        },
    );

    let (tx, rx) = mpsc::channel::<Bytes>(1);
    let cancel = state.cancel.clone();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let mut sink = ChannelSink::new(tx);
        session.run(&mut sink, &cancel);
    });

    let audio = &state.config.audio;
    (
        [
            (header::CONTENT_TYPE, "audio/raw".to_string()),
            (
                HeaderName::from_static("x-audio-sample-rate"),
                audio.sample_rate.to_string(),
            ),
            (
                HeaderName::from_static("x-audio-bits-per-sample"),
                BITS_PER_SAMPLE.to_string(),
            ),
            (
                HeaderName::from_static("x-audio-channels"),
                audio.channels.to_string(),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
        ],
        channel_body(rx),
    )
        .into_response()
}

/// MJPEG pass-through of the frame buffer
pub async fn video_stream(State(state): State<Arc<AppState>>) -> Response {
    let Some(frames) = state.video.clone() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error("video is not configured")),
        )
            .into_response();
    };

    let video = &state.config.video;
    let framer = MjpegFramer::new(&video.boundary);
    let period = Duration::from_secs_f64(1.0 / video.fps as f64);

    let client_id = Uuid::new_v4();
    let guard = SessionGuard::register(
        state.clone(),
        client_id,
        SessionInfo {
            kind: StreamKind::Video,
            started_at: Utc::now(),
            stats: None,
        },
    );

    // Three parts per frame; the channel holds one frame
    let (tx, rx) = mpsc::channel::<Bytes>(3);
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let mut interval = tokio::time::interval(period);
        tracing::info!("Video client {} connected", client_id);

        'frames: loop {
            interval.tick().await;
            if cancel.is_cancelled() {
                break;
            }

            let frame = match frames.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Frame capture failed: {}", e);
                    continue;
                }
            };

            for part in framer.parts(frame) {
                if tx.send(part).await.is_err() {
                    break 'frames;
                }
            }
        }

        tracing::info!("Video client {} disconnected", client_id);
    });

    (
        [
            (header::CONTENT_TYPE, mjpeg::content_type(&video.boundary)),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        channel_body(rx),
    )
        .into_response()
}
