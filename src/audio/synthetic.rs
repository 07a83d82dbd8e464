//! Synthetic test-tone peripheral
//!
//! Produces sine tones encoded in the raw codec word layout, optionally
//! paced at the sample rate. Used when no capture hardware is attached
//! and by the test suite.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use crate::audio::convert::WordLayout;
use crate::audio::source::{DualChannelSource, FrameSource, Peripheral, SourceProvider};
use crate::cancel::CancelToken;
use crate::constants::WORDS_PER_PERIPHERAL;
use crate::error::AudioError;

/// Ticks between pacing checks
const PACE_BLOCK: u64 = 256;

/// Tone peak amplitude (about -12 dBFS)
const AMPLITUDE: f32 = 8192.0;

/// Stereo tone generator standing in for one receive peripheral
pub struct ToneGenerator {
    frequencies: [f32; WORDS_PER_PERIPHERAL],
    sample_rate: u32,
    layout: WordLayout,
    tick: u64,
    /// Set on the first paced read
    started: Option<Instant>,
    paced: bool,
}

impl ToneGenerator {
    pub fn new(
        frequencies: [f32; WORDS_PER_PERIPHERAL],
        sample_rate: u32,
        layout: WordLayout,
        paced: bool,
    ) -> Self {
        Self {
            frequencies,
            sample_rate,
            layout,
            tick: 0,
            started: None,
            paced,
        }
    }

    /// Samples generated so far per channel
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    fn pace(&mut self, cancel: &CancelToken) -> Result<(), AudioError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if self.tick % PACE_BLOCK != 0 {
            return Ok(());
        }

        let due = Duration::from_secs_f64(self.tick as f64 / self.sample_rate as f64);
        let elapsed = started.elapsed();
        if due > elapsed && cancel.wait_timeout(due - elapsed) {
            return Err(AudioError::Cancelled);
        }
        Ok(())
    }
}

impl Peripheral for ToneGenerator {
    fn read_words(
        &mut self,
        words: &mut [u32; WORDS_PER_PERIPHERAL],
        cancel: &CancelToken,
    ) -> Result<(), AudioError> {
        if cancel.is_cancelled() {
            return Err(AudioError::Cancelled);
        }
        if self.paced {
            self.pace(cancel)?;
        }

        let t = self.tick as f32 / self.sample_rate as f32;
        for (word, freq) in words.iter_mut().zip(self.frequencies) {
            let sample = (AMPLITUDE * (TAU * freq * t).sin()) as i16;
            *word = self.layout.widen(sample);
        }
        self.tick += 1;
        Ok(())
    }
}

/// Opens tone sources with one distinct frequency per channel
#[derive(Debug, Clone)]
pub struct ToneProvider {
    channels: usize,
    sample_rate: u32,
    layout: WordLayout,
    paced: bool,
}

impl ToneProvider {
    pub fn new(channels: usize, sample_rate: u32, layout: WordLayout, paced: bool) -> Self {
        Self {
            channels,
            sample_rate,
            layout,
            paced,
        }
    }

    fn generator(&self, base: f32) -> ToneGenerator {
        ToneGenerator::new([base, base * 1.5], self.sample_rate, self.layout, self.paced)
    }
}

impl SourceProvider for ToneProvider {
    fn channels(&self) -> usize {
        self.channels
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, AudioError> {
        match self.channels {
            2 => Ok(Box::new(DualChannelSource::single(self.generator(440.0)))),
            4 => Ok(Box::new(DualChannelSource::new(
                self.generator(440.0),
                self.generator(880.0),
            ))),
            n => Err(AudioError::UnsupportedFormat(format!(
                "tone source supports 2 or 4 channels, not {}",
                n
            ))),
        }
    }
}
