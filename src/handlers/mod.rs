//! Built-in message handlers

pub mod playback;

use std::sync::Arc;

use crate::audio::playback::AudioPlaybackBridge;
use crate::broker::handler::HandlerRegistry;
use crate::config::AppConfig;

pub use playback::{FilePlayer, PlaybackHandler};

/// Registry with every built-in handler, keyed by the name queues refer to
pub fn builtin_registry(config: &AppConfig) -> HandlerRegistry {
    let bridge = AudioPlaybackBridge::new(config.output.clone(), config.decoder.clone());
    HandlerRegistry::new().with(
        "play",
        Arc::new(PlaybackHandler::new(config.storage.clone(), Arc::new(bridge))),
    )
}
