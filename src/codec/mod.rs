//! External decode pipeline
//!
//! Probing and decoding are delegated to ffprobe/ffmpeg processes; the
//! rest of the crate only sees a [`std::io::Read`] of raw PCM.

pub mod decoder;
pub mod probe;

pub use decoder::{FfmpegDecoder, SampleFormat};
pub use probe::{probe, StreamInfo};
