//! Double buffer for PCM samples
//!
//! Two fixed-capacity buffers alternate between being filled from the
//! sample source and being drained to the network. Samples are stored
//! channel-interleaved as little-endian 16-bit PCM so the drained view can
//! be written to a socket as-is.

use tracing::warn;

use crate::audio::convert::SampleConverter;
use crate::audio::source::FrameSource;
use crate::cancel::CancelToken;
use crate::constants::{BYTES_PER_SAMPLE, MAX_FRAME_WORDS};
use crate::error::AudioError;

/// Identity of one of the two buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferId {
    A,
    B,
}

impl BufferId {
    fn index(self) -> usize {
        match self {
            BufferId::A => 0,
            BufferId::B => 1,
        }
    }
}

/// Which buffer is filled and which is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    FillASendB,
    FillBSendA,
}

impl BufferState {
    pub fn fill_target(self) -> BufferId {
        match self {
            BufferState::FillASendB => BufferId::A,
            BufferState::FillBSendA => BufferId::B,
        }
    }

    pub fn send_target(self) -> BufferId {
        match self {
            BufferState::FillASendB => BufferId::B,
            BufferState::FillBSendA => BufferId::A,
        }
    }

    fn toggled(self) -> Self {
        match self {
            BufferState::FillASendB => BufferState::FillBSendA,
            BufferState::FillBSendA => BufferState::FillASendB,
        }
    }
}

/// Outcome of one completed fill pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
    /// Buffer that was filled and is now the send target
    pub filled: BufferId,
    /// Frames written
    pub frames: usize,
    /// Ticks skipped because of hardware read failures
    pub dropped_ticks: u64,
}

/// Pair of sample buffers owned by exactly one transport
pub struct DoubleBuffer {
    buffers: [Vec<u8>; 2],
    state: BufferState,
    frames_per_buffer: usize,
    channels: usize,
    fills_completed: u64,
    dropped_ticks: u64,
}

impl DoubleBuffer {
    /// Allocate both buffers up front.
    ///
    /// Allocation failure is reported instead of aborting so that only the
    /// requesting session fails.
    pub fn new(frames_per_buffer: usize, channels: usize) -> Result<Self, AudioError> {
        if frames_per_buffer == 0 {
            return Err(AudioError::UnsupportedFormat(
                "buffer must hold at least one frame".to_string(),
            ));
        }
        if channels == 0 || channels > MAX_FRAME_WORDS {
            return Err(AudioError::UnsupportedFormat(format!(
                "unsupported channel count: {}",
                channels
            )));
        }

        let len = frames_per_buffer
            .checked_mul(channels * BYTES_PER_SAMPLE)
            .ok_or(AudioError::BufferAllocation(usize::MAX))?;

        Ok(Self {
            buffers: [Self::allocate(len)?, Self::allocate(len)?],
            state: BufferState::FillASendB,
            frames_per_buffer,
            channels,
            fills_completed: 0,
            dropped_ticks: 0,
        })
    }

    fn allocate(len: usize) -> Result<Vec<u8>, AudioError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| AudioError::BufferAllocation(len))?;
        buffer.resize(len, 0);
        Ok(buffer)
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn fill_target(&self) -> BufferId {
        self.state.fill_target()
    }

    pub fn send_target(&self) -> BufferId {
        self.state.send_target()
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Size in bytes of one drained chunk
    pub fn chunk_len(&self) -> usize {
        self.buffers[0].len()
    }

    pub fn fills_completed(&self) -> u64 {
        self.fills_completed
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    /// Fill the current fill target completely, then swap roles.
    ///
    /// Hardware read failures skip the tick and retry the same slot, so a
    /// completed pass never has gaps. Any other source error (including
    /// cancellation) aborts the pass without swapping.
    pub fn fill<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        converter: &SampleConverter,
        cancel: &CancelToken,
    ) -> Result<FillReport, AudioError> {
        let channels = self.channels;
        if source.channels() != channels {
            return Err(AudioError::UnsupportedFormat(format!(
                "source delivers {} channels, buffer expects {}",
                source.channels(),
                channels
            )));
        }

        let target = self.state.fill_target();
        let buffer = &mut self.buffers[target.index()];
        let mut pcm = [0i16; MAX_FRAME_WORDS];
        let mut dropped = 0u64;

        for (frame_index, slot) in buffer
            .chunks_exact_mut(channels * BYTES_PER_SAMPLE)
            .enumerate()
        {
            let frame = loop {
                match source.read_frame(cancel) {
                    Ok(frame) => break frame,
                    Err(AudioError::HardwareRead(reason)) => {
                        dropped += 1;
                        if cancel.is_cancelled() {
                            self.dropped_ticks += dropped;
                            return Err(AudioError::Cancelled);
                        }
                        // First failure of a pass, then every 1000th
                        if dropped == 1 || dropped % 1000 == 0 {
                            warn!(
                                "Sample tick skipped at frame {} ({} this pass): {}",
                                frame_index, dropped, reason
                            );
                        }
                    }
                    Err(e) => {
                        self.dropped_ticks += dropped;
                        return Err(e);
                    }
                }
            };

            converter.convert_into(&frame, &mut pcm[..channels]);
            for (bytes, sample) in slot.chunks_exact_mut(BYTES_PER_SAMPLE).zip(&pcm[..channels]) {
                bytes.copy_from_slice(&sample.to_le_bytes());
            }
        }

        self.dropped_ticks += dropped;
        self.fills_completed += 1;
        self.state = self.state.toggled();

        Ok(FillReport {
            filled: target,
            frames: self.frames_per_buffer,
            dropped_ticks: dropped,
        })
    }

    /// Byte view of the buffer that is ready to send
    pub fn drain(&self) -> &[u8] {
        &self.buffers[self.state.send_target().index()]
    }

    /// Decoded samples of one buffer, in interleaved order
    pub fn samples(&self, id: BufferId) -> impl Iterator<Item = i16> + '_ {
        self.buffers[id.index()]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }
}
