//! Node configuration
//!
//! One parameterized core covers every board variant: channel count,
//! transports and the collector address all come from here. Values are
//! read from TOML; missing sections fall back to defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::convert::WordLayout;
use crate::constants::*;
use crate::error::Error;
use crate::network::forwarder::RetryPolicy;

/// Where audio frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic test tones
    Tone,
    /// Capture devices (requires the `cpal-input` feature)
    Device,
}

/// Capture and buffering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub source: SourceKind,
    /// 2 (one peripheral) or 4 (two peripherals)
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames (samples per channel) per streamed buffer
    pub frames_per_buffer: usize,
    /// Raw word layout of the microphone part
    pub layout: WordLayout,
    /// Device id of peripheral A
    pub primary_device: String,
    /// Device id of peripheral B
    pub secondary_device: Option<String>,
    /// Pace synthetic tones in real time
    pub paced: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Tone,
            channels: DEFAULT_CHANNELS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            layout: WordLayout::default(),
            primary_device: "default".to_string(),
            secondary_device: None,
            paced: true,
        }
    }
}

impl AudioConfig {
    /// Bytes in one streamed chunk
    pub fn chunk_bytes(&self) -> usize {
        self.frames_per_buffer
            .saturating_mul(self.channels as usize)
            .saturating_mul(BYTES_PER_SAMPLE)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub audio_path: String,
    pub video_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
            audio_path: DEFAULT_AUDIO_PATH.to_string(),
            video_path: DEFAULT_VIDEO_PATH.to_string(),
        }
    }
}

/// Reconnect delay settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RetryConfig {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::Exponential {
            initial_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(self) -> RetryPolicy {
        match self {
            RetryConfig::Fixed { delay_ms } => RetryPolicy::fixed(Duration::from_millis(delay_ms)),
            RetryConfig::Exponential { initial_ms, max_ms } => RetryPolicy::exponential(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            ),
        }
    }
}

/// Persistent collector connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub enabled: bool,
    pub collector_addr: String,
    pub connect_timeout_ms: u64,
    /// A write blocked this long counts as a dropped connection
    pub write_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collector_addr: DEFAULT_COLLECTOR_ADDR.to_string(),
            connect_timeout_ms: 3_000,
            write_timeout_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

impl ForwarderConfig {
    pub fn collector_addr(&self) -> Result<SocketAddr, Error> {
        self.collector_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid collector address {}: {}", self.collector_addr, e)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// MJPEG pass-through settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// JPEG file served as the frame buffer; video is off when unset
    pub jpeg_path: Option<PathBuf>,
    pub fps: u32,
    pub boundary: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            jpeg_path: None,
            fps: 10,
            boundary: MJPEG_BOUNDARY.to_string(),
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub audio: AudioConfig,
    pub http: HttpConfig,
    pub forwarder: ForwarderConfig,
    pub video: VideoConfig,
}

impl NodeConfig {
    /// Load from `path`, else from the user config directory, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// `<config dir>/node.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "wearable", "audio-node")
            .map(|dirs| dirs.config_dir().join("node.toml"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let audio = &self.audio;
        if audio.channels != 2 && audio.channels != 4 {
            return Err(Error::Config(format!(
                "audio.channels must be 2 or 4, got {}",
                audio.channels
            )));
        }
        if audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".to_string()));
        }
        if audio.frames_per_buffer == 0 {
            return Err(Error::Config("audio.frames_per_buffer must be positive".to_string()));
        }
        let chunk = audio
            .frames_per_buffer
            .checked_mul(audio.channels as usize)
            .and_then(|n| n.checked_mul(BYTES_PER_SAMPLE));
        if chunk.is_none() {
            return Err(Error::Config("audio.frames_per_buffer is too large".to_string()));
        }
        if audio.channels == 4 && audio.source == SourceKind::Device && audio.secondary_device.is_none() {
            return Err(Error::Config(
                "audio.secondary_device is required for 4 channel capture".to_string(),
            ));
        }
        audio.layout.validate()?;

        if !self.http.audio_path.starts_with('/') || !self.http.video_path.starts_with('/') {
            return Err(Error::Config("http paths must start with '/'".to_string()));
        }
        if self.http.audio_path == self.http.video_path || self.http.audio_path == "/status" {
            return Err(Error::Config("http paths must be distinct".to_string()));
        }
        if self.forwarder.enabled {
            self.forwarder.collector_addr()?;
        }
        if self.video.fps == 0 {
            return Err(Error::Config("video.fps must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.chunk_bytes(), 4096 * 4 * 2);
        assert_eq!(config.http.audio_path, "/ach1");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            [audio]
            channels = 2
            frames_per_buffer = 512

            [forwarder]
            collector_addr = "10.0.0.5:12346"
            retry = { kind = "fixed", delay_ms = 5000 }
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.forwarder.collector_addr().unwrap().port(), 12346);
        assert_eq!(
            config.forwarder.retry.to_policy().delay(3),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_custom_layout_from_toml() {
        let config = NodeConfig::from_toml(
            r#"
            [audio.layout]
            mask = 0xFFFF0000
            shift = 16
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.audio.layout.shift, 16);
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let mut config = NodeConfig::default();
        config.audio.channels = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_collector_addr() {
        let mut config = NodeConfig::default();
        config.forwarder.collector_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.forwarder.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_clashing_paths() {
        let mut config = NodeConfig::default();
        config.http.video_path = config.http.audio_path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_buffer() {
        let mut config = NodeConfig::default();
        config.audio.frames_per_buffer = usize::MAX;
        assert!(config.validate().is_err());

        config.audio.frames_per_buffer = usize::MAX / 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_device_quad_needs_secondary() {
        let mut config = NodeConfig::default();
        config.audio.source = SourceKind::Device;
        assert!(config.validate().is_err());
        config.audio.secondary_device = Some("input:mic-b".to_string());
        assert!(config.validate().is_ok());
    }
}
