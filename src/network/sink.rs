//! Chunk sinks for the transports
//!
//! A sink is the write side of one stream session. Every chunk handed to
//! a sink is one whole drained buffer.

use bytes::Bytes;
use std::io::Write;
use tokio::sync::mpsc;

use crate::error::NetworkError;

/// Destination for whole-buffer chunks
pub trait ChunkSink {
    /// Whether the peer is still connected
    fn is_alive(&self) -> bool;

    /// Send one chunk; blocks until the transport accepts it
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError>;
}

/// Hands chunks to an async HTTP body through a bounded channel.
///
/// Must be driven from a blocking thread.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl ChunkSink for ChannelSink {
    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(chunk))
            .map_err(|_| NetworkError::SendFailed("response body closed".to_string()))
    }
}

/// Writes chunks to any blocking writer (a TCP socket in practice)
pub struct WriterSink<W: Write> {
    writer: W,
    bytes_written: u64,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ChunkSink for WriterSink<W> {
    /// A socket's liveness is only known by writing to it
    fn is_alive(&self) -> bool {
        true
    }

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), NetworkError> {
        self.writer
            .write_all(chunk)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_sink_counts_bytes() {
        let mut sink = WriterSink::new(Vec::new());
        sink.send_chunk(&[1, 2, 3]).unwrap();
        sink.send_chunk(&[4]).unwrap();
        assert_eq!(sink.bytes_written(), 4);
        assert_eq!(sink.into_inner(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_channel_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);
        assert!(sink.is_alive());

        drop(rx);
        assert!(!sink.is_alive());
        assert!(sink.send_chunk(&[0; 4]).is_err());
    }
}
