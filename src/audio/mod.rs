//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{create_shared_buffer, PlaybackBuffer, SharedPlaybackBuffer};
pub use capture::{AudioCaptureBridge, CaptureStream};
pub use device::{list_devices, AudioDeviceInfo, Direction};
pub use playback::{AbortReason, AudioPlaybackBridge, PlaybackEnd};
