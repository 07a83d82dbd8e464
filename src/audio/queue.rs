//! Tick queue between a capture callback and its reader
//!
//! The device callback pushes one word pair per tick. When the queue is
//! full the pair is lost, and the loss is queued as a marker ahead of the
//! next pair that fits, so the reader sees every tick in order: either as
//! words or as a failed read. Two peripherals fed this way stay on the
//! same tick no matter which one overflows.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::source::Peripheral;
use crate::cancel::CancelToken;
use crate::constants::{CANCEL_POLL_MS, WORDS_PER_PERIPHERAL};
use crate::error::AudioError;

/// One queued tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Captured {
    Words([u32; WORDS_PER_PERIPHERAL]),
    /// This many consecutive ticks were dropped at the queue
    Lost(u64),
}

/// Errors reported by the device, out of band
const ERROR_QUEUE_DEPTH: usize = 16;

/// Create a connected feed/peripheral pair
pub fn tick_queue(label: &str, depth: usize) -> (CaptureFeed, QueuedPeripheral) {
    let (ticks_tx, ticks_rx) = bounded(depth);
    let (errors_tx, errors_rx) = bounded(ERROR_QUEUE_DEPTH);
    let overflows = Arc::new(AtomicU64::new(0));

    let feed = CaptureFeed {
        ticks: ticks_tx,
        errors: errors_tx,
        lost: 0,
        overflows: overflows.clone(),
    };
    let peripheral = QueuedPeripheral {
        label: label.to_string(),
        ticks: ticks_rx,
        errors: errors_rx,
        lost_pending: 0,
        overflows,
    };
    (feed, peripheral)
}

/// Write side, owned by the device callback
pub struct CaptureFeed {
    ticks: Sender<Captured>,
    errors: Sender<AudioError>,
    lost: u64,
    overflows: Arc<AtomicU64>,
}

impl CaptureFeed {
    /// Queue one tick without blocking
    pub fn push(&mut self, words: [u32; WORDS_PER_PERIPHERAL]) {
        if self.lost > 0 {
            if self.ticks.try_send(Captured::Lost(self.lost)).is_err() {
                self.drop_tick();
                return;
            }
            self.lost = 0;
        }
        if self.ticks.try_send(Captured::Words(words)).is_err() {
            self.drop_tick();
        }
    }

    fn drop_tick(&mut self) {
        self.lost += 1;
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Handle for the device's error callback
    pub fn error_sender(&self) -> Sender<AudioError> {
        self.errors.clone()
    }
}

/// Read side of a tick queue.
///
/// Every read accounts for exactly one tick. A device error consumes the
/// tick it was reported on.
pub struct QueuedPeripheral {
    label: String,
    ticks: Receiver<Captured>,
    errors: Receiver<AudioError>,
    lost_pending: u64,
    overflows: Arc<AtomicU64>,
}

impl QueuedPeripheral {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ticks dropped because the reader fell behind
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Next tick's words, or `None` if the tick was lost
    fn take_tick(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<Option<[u32; WORDS_PER_PERIPHERAL]>, AudioError> {
        if self.lost_pending > 0 {
            self.lost_pending -= 1;
            return Ok(None);
        }

        loop {
            match self.ticks.recv_timeout(Duration::from_millis(CANCEL_POLL_MS)) {
                Ok(Captured::Words(words)) => return Ok(Some(words)),
                Ok(Captured::Lost(n)) => {
                    self.lost_pending = n - 1;
                    return Ok(None);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        return Err(AudioError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::StreamError(format!(
                        "capture stream on {} ended",
                        self.label
                    )));
                }
            }
        }
    }
}

impl Peripheral for QueuedPeripheral {
    fn read_words(
        &mut self,
        words: &mut [u32; WORDS_PER_PERIPHERAL],
        cancel: &CancelToken,
    ) -> Result<(), AudioError> {
        let device_error = self.errors.try_recv().ok();
        let tick = self.take_tick(cancel)?;

        if let Some(err) = device_error {
            return Err(err);
        }
        match tick {
            Some(pair) => {
                *words = pair;
                Ok(())
            }
            None => Err(AudioError::HardwareRead(format!(
                "tick lost to capture overflow on {}",
                self.label
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{DualChannelSource, FrameSource};

    fn push_ticks(feed: &mut CaptureFeed, ticks: std::ops::Range<u32>) {
        for t in ticks {
            feed.push([t, t]);
        }
    }

    #[test]
    fn test_device_error_keeps_peripherals_aligned() {
        let (mut feed_a, a) = tick_queue("a", 64);
        let (mut feed_b, b) = tick_queue("b", 64);
        push_ticks(&mut feed_a, 0..4);
        push_ticks(&mut feed_b, 0..4);
        feed_b
            .error_sender()
            .send(AudioError::HardwareRead("overrun".into()))
            .unwrap();

        let mut source = DualChannelSource::new(a, b);
        let cancel = CancelToken::new();

        assert!(matches!(
            source.read_frame(&cancel),
            Err(AudioError::HardwareRead(_))
        ));
        for t in 1..4 {
            let frame = source.read_frame(&cancel).unwrap();
            assert_eq!(frame.words(), &[t, t, t, t]);
        }
    }

    #[test]
    fn test_primary_error_skips_secondary_tick() {
        let (mut feed_a, a) = tick_queue("a", 64);
        let (mut feed_b, b) = tick_queue("b", 64);
        push_ticks(&mut feed_a, 0..3);
        push_ticks(&mut feed_b, 0..3);
        feed_a
            .error_sender()
            .send(AudioError::HardwareRead("overrun".into()))
            .unwrap();

        let mut source = DualChannelSource::new(a, b);
        let cancel = CancelToken::new();

        assert!(source.read_frame(&cancel).is_err());
        assert_eq!(source.read_frame(&cancel).unwrap().words(), &[1, 1, 1, 1]);
        assert_eq!(source.read_frame(&cancel).unwrap().words(), &[2, 2, 2, 2]);
    }

    #[test]
    fn test_one_sided_overflow_keeps_peripherals_aligned() {
        let (mut feed_a, a) = tick_queue("a", 16);
        let (mut feed_b, b) = tick_queue("b", 4);
        let mut source = DualChannelSource::new(a, b);
        let cancel = CancelToken::new();

        // B holds 0..4 and drops 4..8
        push_ticks(&mut feed_a, 0..8);
        push_ticks(&mut feed_b, 0..8);
        for t in 0..4 {
            assert_eq!(source.read_frame(&cancel).unwrap().words(), &[t, t, t, t]);
        }

        push_ticks(&mut feed_a, 8..10);
        push_ticks(&mut feed_b, 8..10);
        for _ in 4..8 {
            assert!(matches!(
                source.read_frame(&cancel),
                Err(AudioError::HardwareRead(_))
            ));
        }
        assert_eq!(source.read_frame(&cancel).unwrap().words(), &[8, 8, 8, 8]);
        assert_eq!(source.read_frame(&cancel).unwrap().words(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_overflow_is_counted() {
        let (mut feed, peripheral) = tick_queue("a", 2);
        push_ticks(&mut feed, 0..5);
        assert_eq!(peripheral.overflows(), 3);
    }

    #[test]
    fn test_closed_feed_ends_stream() {
        let (feed, mut peripheral) = tick_queue("a", 2);
        drop(feed);
        let mut words = [0u32; 2];
        assert!(matches!(
            peripheral.read_words(&mut words, &CancelToken::new()),
            Err(AudioError::StreamError(_))
        ));
    }
}
