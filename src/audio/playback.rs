//! Playback of decoded files through an output device
//!
//! The decoder output is cut into fixed-size blocks and pushed into a
//! bounded [`PlaybackBuffer`] by the calling thread. The cpal output
//! callback pops one block per period and never blocks. Any abnormal
//! condition seen by the callback ends the stream; the callback reports the
//! reason back to the feeder instead of unwinding.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::{create_shared_buffer, PcmBlock, PlaybackBuffer, PushOutcome, SharedPlaybackBuffer};
use crate::audio::device::find_output_device;
use crate::codec::{probe, FfmpegDecoder, SampleFormat};
use crate::config::{DecoderConfig, DeviceConfig};
use crate::constants::{PLAY_BLOCK_SIZE, PLAY_QUEUE_SIZE};
use crate::error::{AudioError, DecodeError, Result};

/// Why the output stream was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Callback asked for a frame count other than the negotiated block size
    FrameCountMismatch { expected: usize, actual: usize },
    /// Device reported an output underflow or another status error
    OutputUnderflow,
    /// No decoded block was ready in time
    BufferEmpty,
    /// Decoded block length does not match the output buffer
    BlockSizeMismatch { expected: usize, actual: usize },
    /// Device went away mid-stream
    DeviceUnavailable,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FrameCountMismatch { expected, actual } => {
                write!(f, "expected {} frames per callback, got {}", expected, actual)
            }
            AbortReason::OutputUnderflow => write!(f, "output underflow: increase blocksize?"),
            AbortReason::BufferEmpty => write!(f, "buffer is empty: increase buffersize?"),
            AbortReason::BlockSizeMismatch { expected, actual } => {
                write!(f, "block of {} samples for a {} sample buffer", actual, expected)
            }
            AbortReason::DeviceUnavailable => write!(f, "output device no longer available"),
        }
    }
}

/// How a stream ended, as seen from the callback side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Drained,
    Aborted(AbortReason),
}

/// How a successful playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Decoder reached end of file and the buffer drained
    Finished,
    /// Buffer stayed full for a whole buffer duration
    Saturated,
}

/// Flags shared by the output callback, the error callback and the feeder
pub struct StreamControl {
    status_error: AtomicBool,
    finished: AtomicBool,
    ended: AtomicBool,
    outcome_tx: Sender<StreamOutcome>,
    outcome_rx: Receiver<StreamOutcome>,
}

impl StreamControl {
    pub fn new() -> Self {
        let (outcome_tx, outcome_rx) = bounded(1);
        Self {
            status_error: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            outcome_tx,
            outcome_rx,
        }
    }

    /// No more blocks will be pushed
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Record the first terminal outcome; later ones are ignored
    pub fn report(&self, outcome: StreamOutcome) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            let _ = self.outcome_tx.try_send(outcome);
        }
    }

    /// Called from the cpal error callback
    pub fn on_stream_error(&self, err: &cpal::StreamError) {
        tracing::error!("Output stream error: {}", err);
        match err {
            cpal::StreamError::DeviceNotAvailable => {
                self.report(StreamOutcome::Aborted(AbortReason::DeviceUnavailable))
            }
            _ => self.status_error.store(true, Ordering::SeqCst),
        }
    }

    pub fn flag_status_error(&self) {
        self.status_error.store(true, Ordering::SeqCst);
    }

    fn take_status_error(&self) -> bool {
        self.status_error.swap(false, Ordering::SeqCst)
    }

    pub fn try_outcome(&self) -> Option<StreamOutcome> {
        self.outcome_rx.try_recv().ok()
    }

    pub fn wait_outcome(&self, timeout: Duration) -> Option<StreamOutcome> {
        self.outcome_rx.recv_timeout(timeout).ok()
    }
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

/// What one output callback invocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Played,
    /// Stream already ended; output silenced
    Silence,
    Drained,
    Aborted(AbortReason),
}

/// Real-time side of playback
pub struct OutputCallback {
    buffer: SharedPlaybackBuffer,
    control: Arc<StreamControl>,
    block_size: usize,
    channels: usize,
}

impl OutputCallback {
    pub fn new(
        buffer: SharedPlaybackBuffer,
        control: Arc<StreamControl>,
        block_size: usize,
        channels: usize,
    ) -> Self {
        Self {
            buffer,
            control,
            block_size,
            channels,
        }
    }

    /// Fill one output period. Only a non-blocking pop and atomics happen here.
    pub fn fill(&self, out: &mut [f32]) -> CallbackOutcome {
        if self.control.is_ended() {
            out.fill(0.0);
            return CallbackOutcome::Silence;
        }

        let outcome = self.next_block(out);
        match outcome {
            CallbackOutcome::Aborted(reason) => {
                out.fill(0.0);
                self.control.report(StreamOutcome::Aborted(reason));
            }
            CallbackOutcome::Drained => {
                out.fill(0.0);
                self.control.report(StreamOutcome::Drained);
            }
            CallbackOutcome::Played | CallbackOutcome::Silence => {}
        }
        outcome
    }

    fn next_block(&self, out: &mut [f32]) -> CallbackOutcome {
        if out.len() != self.block_size * self.channels {
            return CallbackOutcome::Aborted(AbortReason::FrameCountMismatch {
                expected: self.block_size,
                actual: out.len() / self.channels.max(1),
            });
        }
        if self.control.take_status_error() {
            return CallbackOutcome::Aborted(AbortReason::OutputUnderflow);
        }

        // Read before popping so a final push is visible once this is set.
        let finished = self.control.is_finished();
        match self.buffer.pop() {
            Some(block) if block.len() == out.len() => {
                out.copy_from_slice(&block);
                CallbackOutcome::Played
            }
            Some(block) => CallbackOutcome::Aborted(AbortReason::BlockSizeMismatch {
                expected: out.len(),
                actual: block.len(),
            }),
            None if finished => CallbackOutcome::Drained,
            None => CallbackOutcome::Aborted(AbortReason::BufferEmpty),
        }
    }
}

/// Cuts a raw f32le byte stream into fixed-size sample blocks
pub struct PcmBlockReader<R> {
    reader: R,
    bytes: Vec<u8>,
    eof: bool,
}

impl<R: Read> PcmBlockReader<R> {
    /// `block_samples` is frames per block times channels
    pub fn new(reader: R, block_samples: usize) -> Self {
        Self {
            reader,
            bytes: vec![0u8; block_samples * SampleFormat::F32Le.bytes_per_sample()],
            eof: false,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Next full block. A trailing partial block is padded with silence.
    pub fn next_block(&mut self) -> io::Result<Option<PcmBlock>> {
        if self.eof {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.reader.read(&mut self.bytes[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        self.bytes[filled..].fill(0);

        Ok(Some(
            self.bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ))
    }
}

/// Playable duration of a full buffer
pub fn feed_timeout(block_size: u32, capacity: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(block_size as f64 * capacity as f64 / sample_rate.max(1) as f64)
}

fn decode_failure(err: io::Error) -> DecodeError {
    DecodeError::ProcessFailed(err.to_string())
}

/// Fill the buffer to capacity, or until the decoder runs dry
pub fn prime<R: Read>(blocks: &mut PcmBlockReader<R>, buffer: &PlaybackBuffer) -> Result<usize> {
    while !buffer.is_full() {
        match blocks.next_block().map_err(decode_failure)? {
            Some(block) => {
                if buffer.try_push(block).is_err() {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(buffer.len())
}

fn settle(outcome: StreamOutcome) -> Result<PlaybackEnd> {
    match outcome {
        StreamOutcome::Drained => Ok(PlaybackEnd::Finished),
        StreamOutcome::Aborted(reason) => {
            tracing::error!("Playback aborted: {}", reason);
            Err(AudioError::PlaybackAborted(reason).into())
        }
    }
}

/// Keep the buffer topped up until end of file, saturation or abort
pub fn run_feed<R: Read>(
    blocks: &mut PcmBlockReader<R>,
    buffer: &PlaybackBuffer,
    control: &StreamControl,
    timeout: Duration,
) -> Result<PlaybackEnd> {
    loop {
        if let Some(outcome) = control.try_outcome() {
            return settle(outcome);
        }

        match blocks.next_block().map_err(decode_failure)? {
            Some(block) => match buffer.push_timeout(block, timeout) {
                PushOutcome::Pushed => {}
                PushOutcome::Saturated => {
                    if let Some(outcome) = control.try_outcome() {
                        return settle(outcome);
                    }
                    tracing::warn!("Playback buffer saturated for {:?}, stopping", timeout);
                    return Ok(PlaybackEnd::Saturated);
                }
            },
            None => {
                control.mark_finished();
                break;
            }
        }
    }

    // Everything left plays within one buffer duration; allow the same again as slack.
    match control.wait_outcome(timeout * 2) {
        Some(outcome) => settle(outcome),
        None => {
            tracing::warn!("Playback buffer did not drain within {:?}", timeout * 2);
            Ok(PlaybackEnd::Finished)
        }
    }
}

/// Plays files through the configured output device
pub struct AudioPlaybackBridge {
    output: DeviceConfig,
    decoder: DecoderConfig,
    block_size: u32,
    queue_size: usize,
}

impl AudioPlaybackBridge {
    pub fn new(output: DeviceConfig, decoder: DecoderConfig) -> Self {
        Self {
            output,
            decoder,
            block_size: PLAY_BLOCK_SIZE,
            queue_size: PLAY_QUEUE_SIZE,
        }
    }

    pub fn with_buffering(mut self, block_size: u32, queue_size: usize) -> Self {
        self.block_size = block_size;
        self.queue_size = queue_size;
        self
    }

    /// Decode and play `path`, blocking until playback ends
    pub fn play(&self, path: &Path) -> Result<PlaybackEnd> {
        let info = probe(&self.decoder, path)?;
        let channels = info.channels as usize;
        let decoder = FfmpegDecoder::spawn(&self.decoder, path, &info, SampleFormat::F32Le)?;

        let mut blocks = PcmBlockReader::new(decoder, self.block_size as usize * channels);
        let buffer = create_shared_buffer(self.queue_size);
        let control = Arc::new(StreamControl::new());

        let primed = prime(&mut blocks, &buffer)?;
        if blocks.is_eof() {
            control.mark_finished();
        }
        tracing::debug!("Primed {}/{} blocks for {}", primed, buffer.capacity(), path.display());

        let device = find_output_device(&self.output.device)?;
        let config = cpal::StreamConfig {
            channels: info.channels,
            sample_rate: cpal::SampleRate(info.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.block_size),
        };

        let callback = OutputCallback::new(
            buffer.clone(),
            control.clone(),
            self.block_size as usize,
            channels,
        );
        let error_control = control.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback.fill(data);
                },
                move |err| error_control.on_stream_error(&err),
                None,
            )
            .map_err(AudioError::from)?;
        stream.play().map_err(AudioError::from)?;

        tracing::info!(
            "Playing {} ({} channel(s) at {}Hz)",
            path.display(),
            info.channels,
            info.sample_rate
        );

        let timeout = feed_timeout(self.block_size, self.queue_size, info.sample_rate);
        let result = if blocks.is_eof() {
            control
                .wait_outcome(timeout * 2)
                .map(settle)
                .unwrap_or(Ok(PlaybackEnd::Finished))
        } else {
            run_feed(&mut blocks, &buffer, &control, timeout)
        };

        drop(stream);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BLOCK: usize = 1024;
    const CHANNELS: usize = 2;

    fn pcm_bytes(samples: usize, value: f32) -> Vec<u8> {
        std::iter::repeat(value.to_le_bytes())
            .take(samples)
            .flatten()
            .collect()
    }

    fn setup(capacity: usize) -> (SharedPlaybackBuffer, Arc<StreamControl>, OutputCallback) {
        let buffer = create_shared_buffer(capacity);
        let control = Arc::new(StreamControl::new());
        let callback = OutputCallback::new(buffer.clone(), control.clone(), BLOCK, CHANNELS);
        (buffer, control, callback)
    }

    #[test]
    fn test_plays_full_blocks_then_aborts_on_empty() {
        let (buffer, control, callback) = setup(4);
        buffer.try_push(vec![0.25; BLOCK * CHANNELS]).unwrap();
        buffer.try_push(vec![0.5; BLOCK * CHANNELS]).unwrap();

        let mut out = vec![0.0f32; BLOCK * CHANNELS];
        // 1024 frames x 2 channels x 4 bytes per callback
        assert_eq!(std::mem::size_of_val(out.as_slice()), 8192);

        assert_eq!(callback.fill(&mut out), CallbackOutcome::Played);
        assert!(out.iter().all(|s| *s == 0.25));
        assert_eq!(callback.fill(&mut out), CallbackOutcome::Played);
        assert!(out.iter().all(|s| *s == 0.5));

        assert_eq!(
            callback.fill(&mut out),
            CallbackOutcome::Aborted(AbortReason::BufferEmpty)
        );
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(
            control.try_outcome(),
            Some(StreamOutcome::Aborted(AbortReason::BufferEmpty))
        );
        assert_eq!(callback.fill(&mut out), CallbackOutcome::Silence);
    }

    #[test]
    fn test_frame_count_mismatch_aborts_with_data_available() {
        let (buffer, _control, callback) = setup(2);
        buffer.try_push(vec![1.0; BLOCK * CHANNELS]).unwrap();

        let mut out = vec![0.0f32; 512 * CHANNELS];
        assert_eq!(
            callback.fill(&mut out),
            CallbackOutcome::Aborted(AbortReason::FrameCountMismatch {
                expected: BLOCK,
                actual: 512
            })
        );
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_underflow_aborts_even_with_data() {
        let (buffer, control, callback) = setup(2);
        buffer.try_push(vec![1.0; BLOCK * CHANNELS]).unwrap();
        control.flag_status_error();

        let mut out = vec![0.0f32; BLOCK * CHANNELS];
        assert_eq!(
            callback.fill(&mut out),
            CallbackOutcome::Aborted(AbortReason::OutputUnderflow)
        );
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_short_block_aborts() {
        let (buffer, _control, callback) = setup(2);
        buffer.try_push(vec![1.0; 10]).unwrap();

        let mut out = vec![0.0f32; BLOCK * CHANNELS];
        assert!(matches!(
            callback.fill(&mut out),
            CallbackOutcome::Aborted(AbortReason::BlockSizeMismatch { actual: 10, .. })
        ));
    }

    #[test]
    fn test_empty_after_finish_is_drained() {
        let (_buffer, control, callback) = setup(2);
        control.mark_finished();

        let mut out = vec![1.0f32; BLOCK * CHANNELS];
        assert_eq!(callback.fill(&mut out), CallbackOutcome::Drained);
        assert_eq!(control.try_outcome(), Some(StreamOutcome::Drained));
    }

    #[test]
    fn test_block_reader_pads_tail() {
        let mut bytes = pcm_bytes(8, 1.0);
        bytes.extend(pcm_bytes(3, -1.0));
        let mut reader = PcmBlockReader::new(Cursor::new(bytes), 8);

        assert_eq!(reader.next_block().unwrap().unwrap(), vec![1.0; 8]);
        let tail = reader.next_block().unwrap().unwrap();
        assert_eq!(tail, vec![-1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(reader.is_eof());
        assert_eq!(reader.next_block().unwrap(), None);
    }

    #[test]
    fn test_prime_fills_exactly_capacity() {
        let samples = BLOCK * CHANNELS;
        let mut blocks = PcmBlockReader::new(Cursor::new(pcm_bytes(samples * 25, 0.1)), samples);
        let buffer = PlaybackBuffer::new(10);

        assert_eq!(prime(&mut blocks, &buffer).unwrap(), 10);
        assert!(buffer.is_full());
        assert!(!blocks.is_eof());
    }

    #[test]
    fn test_prime_stops_at_eof() {
        let mut blocks = PcmBlockReader::new(Cursor::new(pcm_bytes(16, 0.1)), 8);
        let buffer = PlaybackBuffer::new(10);

        assert_eq!(prime(&mut blocks, &buffer).unwrap(), 2);
        assert_eq!(blocks.next_block().unwrap(), None);
        assert!(blocks.is_eof());
    }

    #[test]
    fn test_feed_timeout_is_buffer_duration() {
        assert_eq!(feed_timeout(1024, 10, 10240), Duration::from_secs(1));
        let timeout = feed_timeout(PLAY_BLOCK_SIZE, PLAY_QUEUE_SIZE, 44100);
        assert!((timeout.as_secs_f64() - 10240.0 / 44100.0).abs() < 1e-9);
    }

    #[test]
    fn test_feed_runs_to_end_of_file() {
        let samples = 16;
        let (buffer, control, callback) = {
            let buffer = create_shared_buffer(3);
            let control = Arc::new(StreamControl::new());
            let callback = OutputCallback::new(buffer.clone(), control.clone(), 8, 2);
            (buffer, control, callback)
        };
        let mut blocks = PcmBlockReader::new(Cursor::new(pcm_bytes(samples * 7, 0.5)), samples);
        prime(&mut blocks, &buffer).unwrap();

        let consumer = std::thread::spawn(move || {
            let mut out = vec![0.0f32; samples];
            let mut played = 0;
            loop {
                match callback.fill(&mut out) {
                    CallbackOutcome::Played => played += 1,
                    CallbackOutcome::Drained => return played,
                    CallbackOutcome::Aborted(reason) => panic!("aborted: {}", reason),
                    CallbackOutcome::Silence => return played,
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });

        let end = run_feed(&mut blocks, &buffer, &control, Duration::from_secs(5)).unwrap();
        assert_eq!(end, PlaybackEnd::Finished);
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn test_feed_saturates_without_consumer() {
        let buffer = PlaybackBuffer::new(2);
        let control = StreamControl::new();
        let mut blocks = PcmBlockReader::new(Cursor::new(pcm_bytes(8 * 10, 0.5)), 8);
        prime(&mut blocks, &buffer).unwrap();

        let end = run_feed(&mut blocks, &buffer, &control, Duration::from_millis(10)).unwrap();
        assert_eq!(end, PlaybackEnd::Saturated);
        assert_eq!(buffer.len(), buffer.capacity());
    }

    #[test]
    fn test_feed_surfaces_abort() {
        let buffer = PlaybackBuffer::new(2);
        let control = StreamControl::new();
        control.report(StreamOutcome::Aborted(AbortReason::OutputUnderflow));
        let mut blocks = PcmBlockReader::new(Cursor::new(pcm_bytes(8 * 10, 0.5)), 8);

        let err = run_feed(&mut blocks, &buffer, &control, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Audio(AudioError::PlaybackAborted(AbortReason::OutputUnderflow))
        ));
    }

    #[test]
    fn test_feed_propagates_decoder_failure() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "decoder died"))
            }
        }

        let buffer = PlaybackBuffer::new(2);
        let control = StreamControl::new();
        let mut blocks = PcmBlockReader::new(Broken, 8);
        let err = run_feed(&mut blocks, &buffer, &control, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, crate::Error::Decode(DecodeError::ProcessFailed(_))));
    }
}
