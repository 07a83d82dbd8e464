//! Error types for the audio node

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// A sampling tick could not be completed; the tick is skipped
    #[error("Hardware read failed: {0}")]
    HardwareRead(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid word layout: mask {mask:#010x}, shift {shift}")]
    InvalidLayout { mask: u32, shift: u32 },

    #[error("Failed to allocate {0} byte sample buffer")]
    BufferAllocation(usize),

    #[error("Read cancelled")]
    Cancelled,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid stream header: {0}")]
    InvalidHeader(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
