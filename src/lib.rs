//! # Wearable Audio Node
//!
//! Synchronized dual-front-end audio capture and real-time PCM streaming
//! for the wearable's arm sensor node.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               ARM SENSOR NODE                               │
//! │  ┌──────────────────────┐             ┌──────────────────────┐              │
//! │  │ Peripheral A (ch0/1) │             │ Peripheral B (ch2/3) │              │
//! │  └──────────┬───────────┘             └──────────┬───────────┘              │
//! │             │      one tick = A then B           │                          │
//! │             ▼                                    ▼                          │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │          DualChannelSource (audio::source) - RawFrame [u32; 4]       │   │
//! │  └──────────────────────────────────┬──────────────────────────────────┘   │
//! │                                     ▼                                       │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │        SampleConverter (audio::convert) - (raw & mask) >> shift      │   │
//! │  └──────────────────────────────────┬──────────────────────────────────┘   │
//! │                                     ▼                                       │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │         DoubleBuffer (audio::buffer) - fill A / send B, swap         │   │
//! │  └───────────────┬─────────────────────────────────────┬───────────────┘   │
//! │   one per client │                                     │ one, permanent     │
//! │                  ▼                                     ▼                    │
//! │  ┌───────────────────────────────┐   ┌───────────────────────────────────┐ │
//! │  │ HTTP session (network::session)│   │ Forwarder (network::forwarder)    │ │
//! │  │ GET /ach1 -> chunked audio/raw │   │ TCP -> header + raw PCM, retry    │ │
//! │  └───────────────┬───────────────┘   └─────────────────┬─────────────────┘ │
//! └──────────────────┼─────────────────────────────────────┼───────────────────┘
//!                    ▼                                     ▼
//!            Browser / PCM client                 Localization collector
//! ```

pub mod audio;
pub mod cancel;
pub mod config;
pub mod error;
pub mod network;
pub mod video;
pub mod web;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate of both front-ends
    pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

    /// Default channel count (two stereo peripherals)
    pub const DEFAULT_CHANNELS: u16 = 4;

    /// PCM bit depth on the wire
    pub const BITS_PER_SAMPLE: u16 = 16;

    /// Bytes per PCM sample on the wire
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Frames (samples per channel) held by one buffer
    pub const DEFAULT_FRAMES_PER_BUFFER: usize = 4096;

    /// Words delivered by one peripheral per tick (left, right)
    pub const WORDS_PER_PERIPHERAL: usize = 2;

    /// Maximum words in one raw frame (two peripherals)
    pub const MAX_FRAME_WORDS: usize = 4;

    /// Default HTTP port
    pub const DEFAULT_HTTP_PORT: u16 = 80;

    /// Default audio endpoint
    pub const DEFAULT_AUDIO_PATH: &str = "/ach1";

    /// Default video endpoint
    pub const DEFAULT_VIDEO_PATH: &str = "/stream";

    /// Default downstream collector address
    pub const DEFAULT_COLLECTOR_ADDR: &str = "192.168.4.2:1001";

    /// Stream header format version sent to the collector
    pub const STREAM_FORMAT_VERSION: u8 = 1;

    /// Multipart boundary token for the MJPEG stream
    pub const MJPEG_BOUNDARY: &str = "123456789000000000000987654321";

    /// Interval at which blocking reads re-check their cancel token (ms)
    pub const CANCEL_POLL_MS: u64 = 50;
}
