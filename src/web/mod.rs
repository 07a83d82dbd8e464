//! HTTP transport
//!
//! Serves the chunked PCM stream, the optional MJPEG pass-through and a
//! JSON status endpoint.

pub mod handlers;
pub mod server;

pub use server::{create_router, AppState, WebServer};
