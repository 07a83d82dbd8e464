//! HTTP server setup and shared state

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::audio::source::SourceProvider;
use crate::cancel::CancelToken;
use crate::config::NodeConfig;
use crate::error::{Error, NetworkError};
use crate::network::forwarder::ForwarderStats;
use crate::network::session::SessionStats;
use crate::video::FrameBuffer;
use crate::web::handlers;

/// Kind of stream a client is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

/// Registry entry for one connected client
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub kind: StreamKind,
    pub started_at: DateTime<Utc>,
    pub stats: Option<Arc<SessionStats>>,
}

/// State shared by all handlers
pub struct AppState {
    pub config: NodeConfig,
    pub provider: Arc<dyn SourceProvider>,
    pub video: Option<Arc<dyn FrameBuffer>>,
    pub forwarder: Option<Arc<ForwarderStats>>,
    pub sessions: DashMap<Uuid, SessionInfo>,
    pub cancel: CancelToken,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl AppState {
    pub fn new(config: NodeConfig, provider: Arc<dyn SourceProvider>, cancel: CancelToken) -> Self {
        Self {
            config,
            provider,
            video: None,
            forwarder: None,
            sessions: DashMap::new(),
            cancel,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn with_video(mut self, video: Arc<dyn FrameBuffer>) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_forwarder(mut self, stats: Arc<ForwarderStats>) -> Self {
        self.forwarder = Some(stats);
        self
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Removes a client from the registry when its stream ends
pub struct SessionGuard {
    id: Uuid,
    state: Arc<AppState>,
}

impl SessionGuard {
    pub fn register(state: Arc<AppState>, id: Uuid, info: SessionInfo) -> Self {
        state.sessions.insert(id, info);
        Self { id, state }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.sessions.remove(&self.id);
    }
}

/// Build the router for the configured paths
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route(&state.config.http.audio_path, get(handlers::audio_stream))
        .route("/status", get(handlers::get_status));

    if state.video.is_some() {
        router = router.route(&state.config.http.video_path, get(handlers::video_stream));
    }

    router.layer(cors).with_state(state)
}

/// Web server for the audio and video endpoints
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, Error> {
        let http = &self.state.config.http;
        let addr: SocketAddr = format!("{}:{}", http.bind_address, http.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid http bind address: {}", e)))?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::from(NetworkError::BindFailed(format!("{}: {}", addr, e))))
    }

    /// Serve until `shutdown` resolves and open streams finish
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        tracing::info!("Starting HTTP server on {}", local_addr);

        let app = create_router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
