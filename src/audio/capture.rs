//! Capture peripheral backed by a cpal input device
//!
//! The cpal stream lives on its own thread (streams are not `Send`). The
//! callback feeds left/right word pairs into a tick queue and the
//! transport thread pulls them with a cancellable blocking read.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::get_device_by_id;
use crate::audio::queue::{tick_queue, QueuedPeripheral};
use crate::audio::source::{DualChannelSource, FrameSource, Peripheral, SourceProvider};
use crate::cancel::CancelToken;
use crate::constants::WORDS_PER_PERIPHERAL;
use crate::error::AudioError;

/// Word pairs buffered between the device callback and the reader
const CAPTURE_QUEUE_DEPTH: usize = 8192;

/// One stereo input device acting as a receive peripheral
pub struct CpalPeripheral {
    device_id: String,
    running: Arc<AtomicBool>,
    queue: QueuedPeripheral,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalPeripheral {
    /// Open `device_id` as a 32-bit stereo input at `sample_rate`
    pub fn open(device_id: &str, sample_rate: u32) -> Result<Self, AudioError> {
        let device = get_device_by_id(device_id)?;
        let config = StreamConfig {
            channels: WORDS_PER_PERIPHERAL as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (mut feed, queue) = tick_queue(device_id, CAPTURE_QUEUE_DEPTH);
        let error_tx = feed.error_sender();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name(format!("capture-{}", device_id))
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[i32], _: &cpal::InputCallbackInfo| {
                        for pair in data.chunks_exact(WORDS_PER_PERIPHERAL) {
                            feed.push([pair[0] as u32, pair[1] as u32]);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::HardwareRead(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let mut peripheral = Self {
            device_id: device_id.to_string(),
            running,
            queue,
            thread_handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!("Capture started on {} at {} Hz", device_id, sample_rate);
                Ok(peripheral)
            }
            Ok(Err(e)) => {
                peripheral.stop();
                Err(e)
            }
            Err(_) => {
                peripheral.stop();
                Err(AudioError::StreamError(format!(
                    "capture thread for {} exited during setup",
                    device_id
                )))
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Word pairs dropped because the reader fell behind
    pub fn overflows(&self) -> u64 {
        self.queue.overflows()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Peripheral for CpalPeripheral {
    fn read_words(
        &mut self,
        words: &mut [u32; WORDS_PER_PERIPHERAL],
        cancel: &CancelToken,
    ) -> Result<(), AudioError> {
        self.queue.read_words(words, cancel)
    }
}

impl Drop for CpalPeripheral {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens one or two input devices as a synchronized source
#[derive(Debug, Clone)]
pub struct CpalProvider {
    primary: String,
    secondary: Option<String>,
    sample_rate: u32,
}

impl CpalProvider {
    pub fn new(primary: String, secondary: Option<String>, sample_rate: u32) -> Self {
        Self {
            primary,
            secondary,
            sample_rate,
        }
    }
}

impl SourceProvider for CpalProvider {
    fn channels(&self) -> usize {
        if self.secondary.is_some() {
            WORDS_PER_PERIPHERAL * 2
        } else {
            WORDS_PER_PERIPHERAL
        }
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, AudioError> {
        let primary = CpalPeripheral::open(&self.primary, self.sample_rate)?;
        match &self.secondary {
            Some(id) => {
                let secondary = CpalPeripheral::open(id, self.sample_rate)?;
                Ok(Box::new(DualChannelSource::new(primary, secondary)))
            }
            None => Ok(Box::new(DualChannelSource::single(primary))),
        }
    }
}
