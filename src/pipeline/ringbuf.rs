//! Bounded frame buffer between capture and processing

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::trace;

use crate::capture::FrameHold;

/// Ring of frame holds that drops the oldest frame when full.
///
/// Dropping a hold releases it, so an overwritten frame goes straight back
/// to the capture layer.
pub struct FrameRingBuffer {
    ring: HeapRb<FrameHold>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: store a frame, evicting the oldest one if full
    pub fn push(&mut self, frame: FrameHold) {
        if let Some(evicted) = self.ring.push_overwrite(frame) {
            trace!(sequence = evicted.sequence(), "Ring full, dropping oldest frame");
            self.record_drop();
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: oldest buffered frame
    pub fn pop(&mut self) -> Option<FrameHold> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: newest buffered frame; older ones are dropped
    pub fn pop_latest(&mut self) -> Option<FrameHold> {
        let mut latest = None;
        while let Some(frame) = self.ring.try_pop() {
            if let Some(stale) = latest.replace(frame) {
                trace!(sequence = stale.sequence(), "Skipping stale frame");
                self.record_drop();
            }
        }
        if latest.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        latest
    }

    /// Release every buffered frame
    pub fn clear(&mut self) -> usize {
        let mut cleared = 0;
        while self.ring.try_pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    fn record_drop(&self) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frameproc_frames_dropped").increment(1);
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameMetadata, Orientation, PixelFormat, SyntheticBuffer};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn hold(sequence: u64, closes: &Arc<AtomicUsize>) -> FrameHold {
        let meta = FrameMetadata {
            sequence,
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Yuv420,
            orientation: Orientation::Portrait,
            is_mirrored: false,
            timestamp: sequence * 1000,
        };
        let buffer =
            SyntheticBuffer::new(2, 2, PixelFormat::Yuv420, 0).with_close_counter(closes.clone());
        FrameHold::adopt(Frame::new(buffer, meta))
    }

    #[test]
    fn full_ring_releases_oldest() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut ring = FrameRingBuffer::new(2);
        for seq in 1..=3 {
            ring.push(hold(seq, &closes));
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(ring.pop().map(|f| f.sequence()), Some(2));
        assert_eq!(ring.stats().dropped, 1);
    }

    #[test]
    fn pop_latest_skips_stale_frames() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut ring = FrameRingBuffer::new(4);
        for seq in 1..=3 {
            ring.push(hold(seq, &closes));
        }
        let latest = ring.pop_latest().unwrap();
        assert_eq!(latest.sequence(), 3);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(ring.is_empty());
        drop(latest);
        assert_eq!(closes.load(Ordering::SeqCst), 3);

        let stats = ring.stats();
        assert_eq!(stats, RingStats { written: 3, read: 1, dropped: 2 });
    }

    #[test]
    fn clear_releases_everything() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut ring = FrameRingBuffer::new(8);
        for seq in 1..=5 {
            ring.push(hold(seq, &closes));
        }
        assert_eq!(ring.clear(), 5);
        assert_eq!(closes.load(Ordering::SeqCst), 5);
        assert!(ring.pop_latest().is_none());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(FrameRingBuffer::new(0).capacity(), 1);
    }
}
