//! Audio subsystem module

pub mod buffer;
pub mod convert;
pub mod queue;
pub mod source;
pub mod synthetic;

#[cfg(feature = "cpal-input")]
pub mod capture;
#[cfg(feature = "cpal-input")]
pub mod device;

pub use buffer::{BufferId, BufferState, DoubleBuffer, FillReport};
pub use convert::{PcmFrame, SampleConverter, WordLayout};
pub use queue::{tick_queue, CaptureFeed, QueuedPeripheral};
pub use source::{DualChannelSource, FrameSource, Peripheral, RawFrame, SourceProvider};
pub use synthetic::{ToneGenerator, ToneProvider};

#[cfg(feature = "cpal-input")]
pub use capture::{CpalPeripheral, CpalProvider};
#[cfg(feature = "cpal-input")]
pub use device::{get_device_by_id, list_devices, AudioDevice, AudioDeviceInfo};
