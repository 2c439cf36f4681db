//! # Aurora Sounddevice
//!
//! Bridges a real-time audio device to an AMQP message fabric.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── CAPTURE ─────────────────────────────┐
//! │  ┌────────────┐   ┌───────────────┐   ┌──────────────────────┐   │
//! │  │ Microphone │──▶│ input callback│──▶│ capture channel mpsc │   │
//! │  └────────────┘   └───────────────┘   └──────────┬───────────┘   │
//! │                                                  ▼               │
//! │                                   ┌──────────────────────────┐   │
//! │                                   │ Publisher (sha256, hdrs) │   │
//! │                                   └──────────────┬───────────┘   │
//! └──────────────────────────────────────────────────┼───────────────┘
//!                                                    ▼
//! ┌──────────────────────────── BROKER ──────────────────────────────┐
//! │  proxy exchange ──▶ proxy queue ──(expire / dead-letter)──┐      │
//! │                                                           ▼      │
//! │                          consumer queue ◀── final exchange       │
//! └──────────────────────────────────┬───────────────────────────────┘
//!                                    ▼
//! ┌──────────────────────────── PLAYBACK ────────────────────────────┐
//! │  ConsumeLoop ──▶ handler ──▶ staging file ──▶ ffmpeg (f32le)     │
//! │                                                  │               │
//! │  ┌─────────┐   ┌─────────────────┐   ┌───────────▼──────────┐    │
//! │  │ Speaker │◀──│ output callback │◀──│ PlaybackBuffer (N)   │    │
//! │  └─────────┘   └─────────────────┘   └──────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Number of decoded blocks held by the playback buffer
    pub const PLAY_QUEUE_SIZE: usize = 10;

    /// Frames per output callback during playback
    pub const PLAY_BLOCK_SIZE: u32 = 1024;

    /// Duration of one captured block in milliseconds
    pub const CAPTURE_BLOCK_MS: u32 = 200;

    /// Channel count used for capture
    pub const CAPTURE_CHANNELS: u16 = 1;

    /// Routing key used when none is given
    pub const DEFAULT_ROUTING_KEY: &str = "*";

    /// Header carrying the producer tag
    pub const HEADER_SOURCE: &str = "v-source";

    /// Header carrying the hex SHA-256 of the body
    pub const HEADER_HASH: &str = "v-hash";

    /// Queue argument naming the dead-letter exchange
    pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

    /// Consumer argument carrying consumer priority
    pub const CONSUMER_PRIORITY_ARG: &str = "x-priority";
}
