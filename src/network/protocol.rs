//! Collector stream header
//!
//! Sent once right after the forwarder connects, followed by raw
//! interleaved PCM with no further framing:
//!
//! ```text
//! ┌─────────┬──────────┬─────────────────┬──────────────────┐
//! │ version │ channels │ bits/sample LE  │ sample rate LE   │
//! │   u8    │    u8    │      u16        │       u32        │
//! └─────────┴──────────┴─────────────────┴──────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{BITS_PER_SAMPLE, STREAM_FORMAT_VERSION};
use crate::error::NetworkError;

/// Stream parameters announced to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub format_version: u8,
    pub channels: u8,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl StreamHeader {
    pub const SIZE: usize = 8;

    /// Header for 16-bit PCM at the current format version
    pub fn pcm16(channels: u8, sample_rate: u32) -> Self {
        Self {
            format_version: STREAM_FORMAT_VERSION,
            channels,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_rate,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.format_version);
        buf.put_u8(self.channels);
        buf.put_u16_le(self.bits_per_sample);
        buf.put_u32_le(self.sample_rate);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < Self::SIZE {
            return Err(NetworkError::InvalidHeader(format!(
                "need {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }

        let header = Self {
            format_version: data.get_u8(),
            channels: data.get_u8(),
            bits_per_sample: data.get_u16_le(),
            sample_rate: data.get_u32_le(),
        };

        if header.format_version != STREAM_FORMAT_VERSION {
            return Err(NetworkError::InvalidHeader(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        if header.channels == 0 || header.bits_per_sample != BITS_PER_SAMPLE {
            return Err(NetworkError::InvalidHeader(format!(
                "unsupported layout: {} channels, {} bits",
                header.channels, header.bits_per_sample
            )));
        }

        Ok(header)
    }

    /// Bytes of PCM per second of audio
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }
}
