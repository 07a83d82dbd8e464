//! Raw codec word to 16-bit PCM conversion
//!
//! The front-ends deliver 32-bit containers holding 16 significant bits
//! at a fixed offset. [`WordLayout`] is the only place that offset is
//! encoded; a different microphone part only changes the layout.

use serde::{Deserialize, Serialize};

use crate::audio::source::RawFrame;
use crate::constants::MAX_FRAME_WORDS;
use crate::error::AudioError;

/// Bit position of the significant sample field inside a raw word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordLayout {
    pub mask: u32,
    pub shift: u32,
}

impl WordLayout {
    /// Mask of the default oversampled codec format
    pub const DEFAULT_MASK: u32 = 0x0FFF_F000;

    /// Guard/extension bits below the sample field
    pub const DEFAULT_SHIFT: u32 = 12;

    /// Create a layout, rejecting fields wider than 16 bits
    pub fn new(mask: u32, shift: u32) -> Result<Self, AudioError> {
        let layout = Self { mask, shift };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), AudioError> {
        if self.shift >= 32 || self.mask == 0 || (self.mask >> self.shift) > u16::MAX as u32 {
            return Err(AudioError::InvalidLayout {
                mask: self.mask,
                shift: self.shift,
            });
        }
        Ok(())
    }

    /// Narrow one raw word to a PCM sample. No rounding.
    #[inline]
    pub fn narrow(&self, raw: u32) -> i16 {
        ((raw & self.mask) >> self.shift) as u16 as i16
    }

    /// Place a PCM sample into a raw word, the inverse of [`narrow`](Self::narrow)
    #[inline]
    pub fn widen(&self, sample: i16) -> u32 {
        ((sample as u16 as u32) << self.shift) & self.mask
    }
}

impl Default for WordLayout {
    fn default() -> Self {
        Self {
            mask: Self::DEFAULT_MASK,
            shift: Self::DEFAULT_SHIFT,
        }
    }
}

/// One converted frame, one sample per active channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFrame {
    samples: [i16; MAX_FRAME_WORDS],
    channels: usize,
}

impl PcmFrame {
    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.channels]
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Stateless converter applying one layout to every word of a frame
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleConverter {
    layout: WordLayout,
}

impl SampleConverter {
    pub fn new(layout: WordLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> WordLayout {
        self.layout
    }

    pub fn convert(&self, frame: &RawFrame) -> PcmFrame {
        let mut samples = [0i16; MAX_FRAME_WORDS];
        self.convert_into(frame, &mut samples);
        PcmFrame {
            samples,
            channels: frame.channels(),
        }
    }

    /// Convert into `out`, which must hold at least `frame.channels()` slots
    #[inline]
    pub fn convert_into(&self, frame: &RawFrame, out: &mut [i16]) {
        for (slot, &word) in out.iter_mut().zip(frame.words()) {
            *slot = self.layout.narrow(word);
        }
    }
}
