//! Audio capture from the input device
//!
//! The cpal stream lives on its own dedicated thread. Each callback period
//! is one capture block of signed 16-bit mono PCM, handed to the async side
//! as [`Bytes`] over an unbounded channel so the callback never waits.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::device::{find_input_device, resolve_sample_rate, Direction};
use crate::broker::publish::{PublishOptions, Publisher};
use crate::config::{ChannelName, DeviceConfig};
use crate::constants::{CAPTURE_BLOCK_MS, CAPTURE_CHANNELS};
use crate::error::{AudioError, Result};

/// Receiving end of captured blocks
pub type CaptureReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Frames in one capture block
pub fn capture_block_frames(sample_rate: u32, block_ms: u32) -> u32 {
    (sample_rate as u64 * block_ms as u64 / 1000) as u32
}

/// Callback side of a capture stream
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<Bytes>,
    blocks: Arc<AtomicU64>,
}

impl CaptureSink {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            tx,
            blocks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Forward one period as little-endian bytes. Returns false once the receiver is gone.
    pub fn on_input(&self, data: &[i16]) -> bool {
        let mut bytes = Vec::with_capacity(data.len() * 2);
        for sample in data {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.tx.send(Bytes::from(bytes)).is_ok()
    }

    pub fn block_count(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Open input stream, stopped on drop
pub struct CaptureStream {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sample_rate: u32,
    block_frames: u32,
}

impl CaptureStream {
    /// Open the configured input device and start capturing
    pub fn open(config: &DeviceConfig) -> std::result::Result<(Self, CaptureReceiver), AudioError> {
        let sample_rate = resolve_sample_rate(config, Direction::Input)?;
        let block_frames = capture_block_frames(sample_rate, CAPTURE_BLOCK_MS);
        let stream_config = cpal::StreamConfig {
            channels: CAPTURE_CHANNELS,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(block_frames),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), AudioError>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let selector = config.device.clone();

        let handle = thread::Builder::new()
            .name("capture-input".to_string())
            .spawn(move || {
                let sink = CaptureSink::new(tx);
                let stream = find_input_device(&selector).and_then(|device| {
                    device
                        .build_input_stream(
                            &stream_config,
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                sink.on_input(data);
                            },
                            move |err| tracing::error!("Input stream error: {}", err),
                            None,
                        )
                        .map_err(AudioError::from)
                });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::from(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let mut capture = Self {
            running,
            thread_handle: Some(handle),
            sample_rate,
            block_frames,
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                capture.stop();
                return Err(e);
            }
            Err(_) => {
                capture.stop();
                return Err(AudioError::StreamError("capture thread exited".to_string()));
            }
        }

        tracing::info!(
            "Capturing {}Hz mono in blocks of {} frames",
            sample_rate,
            block_frames
        );
        Ok((capture, rx))
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_frames(&self) -> u32 {
        self.block_frames
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Publish captured blocks on the detect channel until the stream ends or `shutdown` fires.
/// Returns the number of blocks published.
pub async fn publish_blocks<F>(
    mut blocks: CaptureReceiver,
    publisher: &Publisher,
    source: &str,
    shutdown: F,
) -> Result<u64>
where
    F: Future<Output = ()>,
{
    let options = PublishOptions::with_source(source);
    let mut published = 0u64;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                // Stop accepting new blocks but flush what was already captured.
                blocks.close();
                while let Some(block) = blocks.recv().await {
                    publish_block(publisher, block, &options).await?;
                    published += 1;
                }
                break;
            }
            block = blocks.recv() => match block {
                Some(block) => {
                    publish_block(publisher, block, &options).await?;
                    published += 1;
                }
                None => break,
            },
        }
    }

    Ok(published)
}

async fn publish_block(publisher: &Publisher, block: Bytes, options: &PublishOptions) -> Result<()> {
    let hash = publisher.publish(block, ChannelName::Detect, options).await?;
    tracing::debug!("Got audio block {}", hash);
    Ok(())
}

/// Streams the input device onto the detect channel
pub struct AudioCaptureBridge {
    input: DeviceConfig,
    publisher: Publisher,
    source: String,
}

impl AudioCaptureBridge {
    pub fn new(input: DeviceConfig, publisher: Publisher, source: impl Into<String>) -> Self {
        Self {
            input,
            publisher,
            source: source.into(),
        }
    }

    pub async fn listen<F>(&self, shutdown: F) -> Result<u64>
    where
        F: Future<Output = ()>,
    {
        let (stream, blocks) = CaptureStream::open(&self.input)?;
        tracing::info!("Ready for listening audio from {}", self.input.device);

        let result = publish_blocks(blocks, &self.publisher, &self.source, shutdown).await;
        drop(stream);

        if let Ok(count) = &result {
            tracing::info!("Capture stopped after {} block(s)", count);
        }
        result
    }
}
