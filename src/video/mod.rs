//! Video pass-through
//!
//! The camera pipeline is external; the node only relays finished JPEG
//! frames from a frame buffer as an MJPEG stream.

pub mod mjpeg;

use bytes::Bytes;
use std::path::Path;

use crate::error::Error;

pub use mjpeg::MjpegFramer;

/// Source of finished JPEG frames
pub trait FrameBuffer: Send + Sync {
    /// Latest frame
    fn capture(&self) -> Result<Bytes, Error>;
}

/// Check for the JPEG start-of-image marker
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() > 2 && data[0] == 0xFF && data[1] == 0xD8
}

/// Frame buffer serving one JPEG image from disk
pub struct StaticJpegSource {
    frame: Bytes,
}

impl StaticJpegSource {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        Self::from_bytes(Bytes::from(data))
            .map_err(|_| Error::Config(format!("{} is not a JPEG image", path.display())))
    }

    pub fn from_bytes(frame: Bytes) -> Result<Self, Error> {
        if !is_valid_jpeg(&frame) {
            return Err(Error::Config("frame is not a JPEG image".to_string()));
        }
        Ok(Self { frame })
    }
}

impl FrameBuffer for StaticJpegSource {
    fn capture(&self) -> Result<Bytes, Error> {
        Ok(self.frame.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_jpeg() {
        assert!(StaticJpegSource::from_bytes(Bytes::from_static(b"GIF89a")).is_err());
        let source = StaticJpegSource::from_bytes(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9])).unwrap();
        assert_eq!(source.capture().unwrap().len(), 4);
    }
}
