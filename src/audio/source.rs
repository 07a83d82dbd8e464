//! Synchronized multi-peripheral sample source
//!
//! Each tick reads the primary peripheral and then the secondary one;
//! both reads together form one [`RawFrame`]. A frame is emitted whole or
//! not at all.

use crate::cancel::CancelToken;
use crate::constants::{MAX_FRAME_WORDS, WORDS_PER_PERIPHERAL};
use crate::error::AudioError;

/// One synchronized read across all active peripherals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawFrame {
    words: [u32; MAX_FRAME_WORDS],
    channels: usize,
}

impl RawFrame {
    /// Build a frame from up to four words
    pub fn from_words(words: &[u32]) -> Self {
        let channels = words.len().min(MAX_FRAME_WORDS);
        let mut frame = Self {
            words: [0; MAX_FRAME_WORDS],
            channels,
        };
        frame.words[..channels].copy_from_slice(&words[..channels]);
        frame
    }

    pub fn words(&self) -> &[u32] {
        &self.words[..self.channels]
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// A digital-audio receive channel delivering one stereo word pair per tick
pub trait Peripheral: Send {
    /// Block until the next tick's left/right words are available.
    ///
    /// Every call accounts for exactly one tick: a failed read still
    /// consumes the tick it failed on. Implementations must return
    /// [`AudioError::Cancelled`] promptly once `cancel` fires.
    fn read_words(
        &mut self,
        words: &mut [u32; WORDS_PER_PERIPHERAL],
        cancel: &CancelToken,
    ) -> Result<(), AudioError>;
}

impl<P: Peripheral + ?Sized> Peripheral for Box<P> {
    fn read_words(
        &mut self,
        words: &mut [u32; WORDS_PER_PERIPHERAL],
        cancel: &CancelToken,
    ) -> Result<(), AudioError> {
        (**self).read_words(words, cancel)
    }
}

/// Anything that yields synchronized raw frames
pub trait FrameSource: Send {
    /// Number of words per frame (2 or 4)
    fn channels(&self) -> usize;

    /// Block until the next complete frame, with no timeout
    fn read_frame(&mut self, cancel: &CancelToken) -> Result<RawFrame, AudioError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn read_frame(&mut self, cancel: &CancelToken) -> Result<RawFrame, AudioError> {
        (**self).read_frame(cancel)
    }
}

/// Opens an independent frame source for each transport
pub trait SourceProvider: Send + Sync {
    fn channels(&self) -> usize;

    fn open(&self) -> Result<Box<dyn FrameSource>, AudioError>;
}

/// Two receive peripherals read in lock-step (or one, for stereo nodes)
pub struct DualChannelSource<P: Peripheral> {
    primary: P,
    secondary: Option<P>,
}

impl<P: Peripheral> DualChannelSource<P> {
    /// Four-channel source over two peripherals
    pub fn new(primary: P, secondary: P) -> Self {
        Self {
            primary,
            secondary: Some(secondary),
        }
    }

    /// Two-channel source over a single peripheral
    pub fn single(primary: P) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }
}

impl<P: Peripheral> FrameSource for DualChannelSource<P> {
    fn channels(&self) -> usize {
        if self.secondary.is_some() {
            WORDS_PER_PERIPHERAL * 2
        } else {
            WORDS_PER_PERIPHERAL
        }
    }

    fn read_frame(&mut self, cancel: &CancelToken) -> Result<RawFrame, AudioError> {
        let mut frame = RawFrame {
            words: [0; MAX_FRAME_WORDS],
            channels: self.channels(),
        };

        let mut pair = [0u32; WORDS_PER_PERIPHERAL];
        if let Err(e) = self.primary.read_words(&mut pair, cancel) {
            if let (AudioError::HardwareRead(_), Some(secondary)) = (&e, self.secondary.as_mut()) {
                // Advance the secondary past the same tick
                let mut discarded = [0u32; WORDS_PER_PERIPHERAL];
                if let Err(AudioError::Cancelled) = secondary.read_words(&mut discarded, cancel) {
                    return Err(AudioError::Cancelled);
                }
            }
            return Err(e);
        }
        frame.words[..WORDS_PER_PERIPHERAL].copy_from_slice(&pair);

        if let Some(secondary) = self.secondary.as_mut() {
            // A failed second read discards the primary words too
            secondary.read_words(&mut pair, cancel)?;
            frame.words[WORDS_PER_PERIPHERAL..].copy_from_slice(&pair);
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted reads
    struct Scripted {
        reads: VecDeque<Result<[u32; 2], ()>>,
    }

    impl Scripted {
        fn new(reads: Vec<Result<[u32; 2], ()>>) -> Self {
            Self {
                reads: reads.into(),
            }
        }
    }

    impl Peripheral for Scripted {
        fn read_words(
            &mut self,
            words: &mut [u32; 2],
            _cancel: &CancelToken,
        ) -> Result<(), AudioError> {
            match self.reads.pop_front() {
                Some(Ok(pair)) => {
                    *words = pair;
                    Ok(())
                }
                Some(Err(())) => Err(AudioError::HardwareRead("scripted".into())),
                None => Err(AudioError::Cancelled),
            }
        }
    }

    #[test]
    fn test_frame_orders_primary_then_secondary() {
        let mut source = DualChannelSource::new(
            Scripted::new(vec![Ok([1, 2])]),
            Scripted::new(vec![Ok([3, 4])]),
        );
        let cancel = CancelToken::new();
        let frame = source.read_frame(&cancel).unwrap();
        assert_eq!(frame.words(), &[1, 2, 3, 4]);
        assert_eq!(source.channels(), 4);
    }

    #[test]
    fn test_secondary_failure_discards_whole_frame() {
        let mut source = DualChannelSource::new(
            Scripted::new(vec![Ok([1, 2]), Ok([5, 6])]),
            Scripted::new(vec![Err(()), Ok([7, 8])]),
        );
        let cancel = CancelToken::new();

        assert!(matches!(
            source.read_frame(&cancel),
            Err(AudioError::HardwareRead(_))
        ));
        // Next tick is a fresh, complete frame
        let frame = source.read_frame(&cancel).unwrap();
        assert_eq!(frame.words(), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_primary_failure_consumes_secondary_tick() {
        let mut source = DualChannelSource::new(
            Scripted::new(vec![Err(()), Ok([5, 6])]),
            Scripted::new(vec![Ok([3, 4]), Ok([7, 8])]),
        );
        let cancel = CancelToken::new();

        assert!(matches!(
            source.read_frame(&cancel),
            Err(AudioError::HardwareRead(_))
        ));
        let frame = source.read_frame(&cancel).unwrap();
        assert_eq!(frame.words(), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_single_peripheral_is_stereo() {
        let mut source = DualChannelSource::single(Scripted::new(vec![Ok([9, 10])]));
        let cancel = CancelToken::new();
        let frame = source.read_frame(&cancel).unwrap();
        assert_eq!(source.channels(), 2);
        assert_eq!(frame.words(), &[9, 10]);
    }
}
