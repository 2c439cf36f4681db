//! Bounded block buffer between the playback feeder and the output callback
//!
//! Single producer (feeder thread) and single consumer (real-time output
//! callback). The consumer side only ever calls [`PlaybackBuffer::pop`],
//! which never blocks.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Interleaved f32 samples for one output callback period
pub type PcmBlock = Vec<f32>;

/// Outcome of a timed push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Buffer stayed full for the whole timeout
    Saturated,
}

/// Fixed capacity FIFO of decoded blocks
pub struct PlaybackBuffer {
    tx: Sender<PcmBlock>,
    rx: Receiver<PcmBlock>,
    capacity: usize,
    saturation_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl PlaybackBuffer {
    /// Create a new buffer holding at most `capacity` blocks
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            saturation_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push without waiting. Returns the block back if the buffer is full.
    pub fn try_push(&self, block: PcmBlock) -> Result<(), PcmBlock> {
        self.tx.try_send(block).map_err(|e| match e {
            TrySendError::Full(block) | TrySendError::Disconnected(block) => block,
        })
    }

    /// Push, waiting up to `timeout` for a free slot
    pub fn push_timeout(&self, block: PcmBlock, timeout: Duration) -> PushOutcome {
        match self.tx.send_timeout(block, timeout) {
            Ok(()) => PushOutcome::Pushed,
            // Both ends live in this struct, so disconnection cannot occur.
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                self.saturation_count.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Saturated
            }
        }
    }

    /// Pop the next block without blocking.
    /// Returns None if buffer is empty (underrun)
    pub fn pop(&self) -> Option<PcmBlock> {
        match self.rx.try_recv() {
            Ok(block) => Some(block),
            Err(_) => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn saturation_count(&self) -> usize {
        self.saturation_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a playback buffer
pub type SharedPlaybackBuffer = Arc<PlaybackBuffer>;

/// Create a new shared playback buffer
pub fn create_shared_buffer(capacity: usize) -> SharedPlaybackBuffer {
    Arc::new(PlaybackBuffer::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let buffer = PlaybackBuffer::new(4);
        buffer.try_push(vec![0.0; 8]).unwrap();
        buffer.try_push(vec![1.0; 8]).unwrap();
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.pop().unwrap()[0], 0.0);
        assert_eq!(buffer.pop().unwrap()[0], 1.0);
        assert!(buffer.is_empty());
        assert!(buffer.pop().is_none());
        assert_eq!(buffer.underrun_count(), 1);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let buffer = PlaybackBuffer::new(3);
        for i in 0..10 {
            let _ = buffer.try_push(vec![i as f32]);
            assert!(buffer.len() <= buffer.capacity());
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.try_push(vec![99.0]), Err(vec![99.0]));
    }

    #[test]
    fn test_push_timeout_saturates() {
        let buffer = PlaybackBuffer::new(1);
        assert_eq!(
            buffer.push_timeout(vec![0.0], Duration::from_millis(5)),
            PushOutcome::Pushed
        );
        assert_eq!(
            buffer.push_timeout(vec![1.0], Duration::from_millis(5)),
            PushOutcome::Saturated
        );
        assert_eq!(buffer.saturation_count(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_push_waits_for_consumer() {
        let buffer = create_shared_buffer(1);
        buffer.try_push(vec![0.0]).unwrap();

        let consumer = buffer.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            consumer.pop()
        });

        assert_eq!(
            buffer.push_timeout(vec![1.0], Duration::from_secs(5)),
            PushOutcome::Pushed
        );
        assert_eq!(handle.join().unwrap(), Some(vec![0.0]));
    }
}
