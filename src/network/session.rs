//! Chunked audio stream session
//!
//! One session serves one connected client. It owns its own frame source
//! and double buffer and alternates fill and send on a single thread:
//!
//! ```text
//! HeadersSent ──▶ Streaming ──┬──▶ ClientGone ──┐
//!                     ▲   │   └──▶ SendError  ──┼──▶ Closed
//!                     └───┘                     │
//!                 fill, send      (cancelled) ──┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::buffer::DoubleBuffer;
use crate::audio::convert::SampleConverter;
use crate::audio::source::{FrameSource, SourceProvider};
use crate::cancel::CancelToken;
use crate::config::AudioConfig;
use crate::error::{AudioError, NetworkError};
use crate::network::sink::ChunkSink;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    HeadersSent,
    Streaming,
    ClientGone,
    SendError,
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer disconnected before a send; not an error
    ClientGone,
    /// A chunk could not be delivered
    SendError(NetworkError),
    /// The node is shutting down
    Cancelled,
    /// The sample source failed in a way that skipping a tick cannot fix
    SourceError(AudioError),
}

/// Counters shared with the status endpoint
#[derive(Debug, Default)]
pub struct SessionStats {
    pub chunks_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub dropped_ticks: AtomicU64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SessionStatsSnapshot {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub dropped_ticks: u64,
}

/// Streams whole PCM buffers to one client
pub struct AudioSession {
    id: Uuid,
    source: Box<dyn FrameSource>,
    buffers: DoubleBuffer,
    converter: SampleConverter,
    state: SessionState,
    stats: Arc<SessionStats>,
}

impl AudioSession {
    /// Open a private source and allocate the session's buffers.
    ///
    /// Called after the response headers are committed.
    pub fn open(provider: &dyn SourceProvider, audio: &AudioConfig) -> Result<Self, AudioError> {
        let source = provider.open()?;
        Self::with_source(source, audio)
    }

    pub fn with_source(source: Box<dyn FrameSource>, audio: &AudioConfig) -> Result<Self, AudioError> {
        let buffers = DoubleBuffer::new(audio.frames_per_buffer, audio.channels as usize)?;
        Ok(Self {
            id: Uuid::new_v4(),
            source,
            buffers,
            converter: SampleConverter::new(audio.layout),
            state: SessionState::HeadersSent,
            stats: Arc::new(SessionStats::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Run until the client leaves, a send fails, or `cancel` fires
    pub fn run<K: ChunkSink + ?Sized>(&mut self, sink: &mut K, cancel: &CancelToken) -> SessionEnd {
        info!("Audio session {} streaming", self.id);
        self.state = SessionState::Streaming;

        let end = loop {
            if !sink.is_alive() {
                self.state = SessionState::ClientGone;
                break SessionEnd::ClientGone;
            }

            match self.buffers.fill(&mut self.source, &self.converter, cancel) {
                Ok(report) => {
                    if report.dropped_ticks > 0 {
                        self.stats
                            .dropped_ticks
                            .fetch_add(report.dropped_ticks, Ordering::Relaxed);
                    }
                }
                Err(AudioError::Cancelled) => break SessionEnd::Cancelled,
                Err(e) => break SessionEnd::SourceError(e),
            }

            let chunk = self.buffers.drain();
            if let Err(e) = sink.send_chunk(chunk) {
                self.state = SessionState::SendError;
                break SessionEnd::SendError(e);
            }

            self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            debug!("Session {} sent {} byte chunk", self.id, chunk.len());
        };

        match &end {
            SessionEnd::ClientGone => info!("Audio session {}: client disconnected", self.id),
            SessionEnd::SendError(e) => warn!("Audio session {}: failed to send chunk: {}", self.id, e),
            SessionEnd::Cancelled => info!("Audio session {} cancelled", self.id),
            SessionEnd::SourceError(e) => warn!("Audio session {}: source failed: {}", self.id, e),
        }

        self.state = SessionState::Closed;
        end
    }
}
