//! `play` handler: stage the payload to disk and play it

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::playback::{AudioPlaybackBridge, PlaybackEnd};
use crate::broker::handler::MessageHandler;
use crate::broker::publish::content_hash;
use crate::broker::transport::Delivery;
use crate::error::{AudioError, Error, Result};

/// Blocking file playback
pub trait FilePlayer: Send + Sync + 'static {
    fn play(&self, path: &Path) -> Result<PlaybackEnd>;
}

impl FilePlayer for AudioPlaybackBridge {
    fn play(&self, path: &Path) -> Result<PlaybackEnd> {
        AudioPlaybackBridge::play(self, path)
    }
}

/// Plays every delivered payload, acknowledging once playback ends normally
pub struct PlaybackHandler {
    storage: PathBuf,
    player: Arc<dyn FilePlayer>,
}

impl PlaybackHandler {
    pub fn new(storage: impl Into<PathBuf>, player: Arc<dyn FilePlayer>) -> Self {
        Self {
            storage: storage.into(),
            player,
        }
    }

    /// Location a payload with `hash` is staged at
    pub fn staging_path(&self, hash: &str) -> PathBuf {
        self.storage.join(format!("{}.wav", hash))
    }

    async fn stage(&self, hash: &str, body: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.storage).await?;
        let path = self.staging_path(hash);
        tokio::fs::write(&path, body).await?;
        tracing::debug!("Staged {} bytes at {}", body.len(), path.display());
        Ok(path)
    }
}

/// Hash of `delivery`, checked against the producer's claim when present
pub fn verify_content_hash(delivery: &Delivery) -> Result<String> {
    let computed = content_hash(&delivery.body);
    match delivery.content_hash() {
        Some(header) if header != computed => Err(Error::HashMismatch {
            header: header.to_string(),
            computed,
        }),
        _ => Ok(computed),
    }
}

#[async_trait]
impl MessageHandler for PlaybackHandler {
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        let hash = verify_content_hash(&delivery)?;
        let path = self.stage(&hash, &delivery.body).await?;

        tracing::info!(
            "Playing {} from {}",
            hash,
            delivery.source().unwrap_or("unknown source")
        );
        let player = self.player.clone();
        let end = tokio::task::spawn_blocking(move || player.play(&path))
            .await
            .map_err(|e| AudioError::StreamError(format!("playback worker failed: {}", e)))??;

        if end == PlaybackEnd::Saturated {
            tracing::warn!("Playback of {} stopped early on a saturated buffer", hash);
        }
        delivery.ack().await?;
        Ok(())
    }
}
