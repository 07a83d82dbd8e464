//! MJPEG multipart framing
//!
//! Each frame goes out as three parts: the boundary line, the part
//! headers, and the JPEG bytes.

use bytes::{BufMut, Bytes, BytesMut};

/// Content type of the multipart response
pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={}", boundary)
}

/// Frames JPEG images for a multipart stream
#[derive(Debug, Clone)]
pub struct MjpegFramer {
    boundary_line: Bytes,
}

impl MjpegFramer {
    pub fn new(boundary: &str) -> Self {
        let mut line = BytesMut::with_capacity(boundary.len() + 4);
        line.put_slice(b"--");
        line.put_slice(boundary.as_bytes());
        line.put_slice(b"\r\n");
        Self {
            boundary_line: line.freeze(),
        }
    }

    /// Boundary line, part headers, JPEG payload
    pub fn parts(&self, jpeg: Bytes) -> [Bytes; 3] {
        let headers = format!(
            "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        [self.boundary_line.clone(), Bytes::from(headers), jpeg]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_per_frame() {
        let framer = MjpegFramer::new("tok");
        let jpeg = Bytes::from_static(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);

        let parts = framer.parts(jpeg.clone());
        assert_eq!(parts[0].as_ref(), b"--tok\r\n");
        assert_eq!(
            parts[1].as_ref(),
            b"Content-Type: image/jpeg\r\nContent-Length: 7\r\n\r\n"
        );
        assert_eq!(parts[2], jpeg);
    }

    #[test]
    fn test_repeated_frames_lose_no_bytes() {
        let framer = MjpegFramer::new("frame");
        let frames: Vec<Bytes> = (0..3u8)
            .map(|i| Bytes::from(vec![0xFF, 0xD8, i, i, 0xFF, 0xD9]))
            .collect();

        let stream: Vec<u8> = frames
            .iter()
            .flat_map(|f| framer.parts(f.clone()))
            .flat_map(|part| part.to_vec())
            .collect();

        let mut expected = Vec::new();
        for f in &frames {
            expected.extend_from_slice(b"--frame\r\n");
            expected.extend_from_slice(b"Content-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n");
            expected.extend_from_slice(f);
        }
        assert_eq!(stream, expected);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(
            content_type("abc"),
            "multipart/x-mixed-replace; boundary=abc"
        );
    }
}
