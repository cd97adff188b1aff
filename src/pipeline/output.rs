//! Capture-side entry point of the processing pipeline
//!
//! The capture thread calls [`FrameOutput::push`] for every frame. The frame
//! is parked in a small ring and the scheduler is signalled; on wake-up the
//! processing context takes the newest frame, runs the dispatcher and sends
//! the report. Older frames that were never picked up are released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::Sender;
use tracing::{debug, info, instrument, trace};

use super::dispatcher::{send_report, Dispatcher, FrameReport};
use super::ringbuf::{FrameRingBuffer, RingStats};
use crate::capture::{Frame, FrameHold};
use crate::scheduler::{ExecutionContext, Scheduler, SchedulerError, SchedulerStats};
use crate::Metrics;

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    processed: AtomicU64,
    plugin_failures: AtomicU64,
    processing_ns: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FrameOutput {
    frames: Arc<Mutex<FrameRingBuffer>>,
    scheduler: Scheduler,
    counters: Arc<Counters>,
}

impl FrameOutput {
    /// Wire `dispatcher` to run on `context`, buffering at most
    /// `ring_capacity` frames.
    pub fn new(
        context: Arc<dyn ExecutionContext>,
        dispatcher: Dispatcher,
        ring_capacity: usize,
        reports: Sender<FrameReport>,
    ) -> Self {
        let frames = Arc::new(Mutex::new(FrameRingBuffer::new(ring_capacity)));
        let counters = Arc::new(Counters::default());
        let dispatcher = Mutex::new(dispatcher);

        let handler_frames = frames.clone();
        let handler_counters = counters.clone();
        let scheduler = Scheduler::new(context, move || {
            let Some(frame) = lock(&handler_frames).pop_latest() else {
                trace!("Wake-up without a pending frame");
                return;
            };

            let report = lock(&dispatcher).process(frame);
            handler_counters.processed.fetch_add(1, Ordering::Relaxed);
            handler_counters
                .plugin_failures
                .fetch_add(report.failures().count() as u64, Ordering::Relaxed);
            handler_counters
                .processing_ns
                .fetch_add(report.elapsed.as_nanos() as u64, Ordering::Relaxed);
            send_report(&reports, report);
        });

        info!("Frame output ready (ring capacity {})", ring_capacity.max(1));
        Self {
            frames,
            scheduler,
            counters,
        }
    }

    /// Hand a freshly captured frame to the pipeline. Takes over the frame's
    /// initial hold; after shutdown the frame is released immediately.
    #[instrument(skip_all, fields(sequence = frame.sequence()))]
    pub fn push(&self, frame: Frame) -> Result<(), SchedulerError> {
        let frame = FrameHold::adopt(frame);
        {
            // Checked under the ring lock so shutdown's clear cannot miss it
            let mut frames = lock(&self.frames);
            if self.scheduler.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }
            frames.push(frame);
        }

        self.counters.captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frameproc_frames_captured").increment(1);
        self.scheduler.signal().map(|_| ())
    }

    /// Stop processing and release every buffered frame.
    pub fn shutdown(&self) {
        if self.scheduler.is_cancelled() {
            return;
        }
        self.scheduler.cancel();
        let released = lock(&self.frames).clear();
        debug!("Frame output shut down, released {} buffered frames", released);
    }

    pub fn buffered(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn ring_stats(&self) -> RingStats {
        lock(&self.frames).stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn metrics(&self) -> Metrics {
        let ring = self.ring_stats();
        let scheduler = self.scheduler_stats();
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let processing_ns = self.counters.processing_ns.load(Ordering::Relaxed);
        Metrics {
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_processed: processed,
            frames_dropped: ring.dropped as u64,
            wakeups: scheduler.wakeups,
            coalesced_signals: scheduler.coalesced,
            plugin_failures: self.counters.plugin_failures.load(Ordering::Relaxed),
            avg_processing_us: if processed == 0 {
                0.0
            } else {
                processing_ns as f64 / processed as f64 / 1000.0
            },
        }
    }
}

impl Drop for FrameOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, Orientation, PixelFormat, SyntheticBuffer};
    use crate::plugin::builtin::{register_builtin, EXAMPLE_PLUGIN};
    use crate::plugin::PluginRegistry;
    use crate::scheduler::WorkerThread;
    use crate::PluginConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn frame(sequence: u64, closes: &Arc<AtomicUsize>) -> Frame {
        let meta = FrameMetadata {
            sequence,
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Yuv420,
            orientation: Orientation::Portrait,
            is_mirrored: false,
            timestamp: sequence,
        };
        let buffer =
            SyntheticBuffer::new(4, 4, PixelFormat::Yuv420, 0).with_close_counter(closes.clone());
        Frame::new(buffer, meta)
    }

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(PluginRegistry::new());
        register_builtin(&registry).unwrap();
        Dispatcher::new(registry, &[PluginConfig::named(EXAMPLE_PLUGIN)]).unwrap()
    }

    #[test]
    fn frames_flow_to_reports() {
        let closes = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(WorkerThread::spawn("output-test").unwrap());
        let (tx, rx) = flume::unbounded();
        let output = FrameOutput::new(worker.clone(), dispatcher(), 2, tx);

        output.push(frame(1, &closes)).unwrap();
        let report = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.sequence, 1);
        assert!(report.outcome(EXAMPLE_PLUGIN).is_some());

        // Every pushed frame is eventually released, processed or not
        for seq in 2..=20 {
            output.push(frame(seq, &closes)).unwrap();
        }
        drop(output);
        worker.shutdown();
        assert_eq!(closes.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn shutdown_racing_pushes_leaves_nothing_buffered() {
        let closes = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(WorkerThread::spawn("output-race").unwrap());
        let (tx, _rx) = flume::unbounded();
        let output = Arc::new(FrameOutput::new(worker.clone(), dispatcher(), 64, tx));

        let pushers: Vec<_> = (0..4u64)
            .map(|t| {
                let output = output.clone();
                let closes = closes.clone();
                std::thread::spawn(move || {
                    let mut created = 0;
                    for i in 0..200 {
                        created += 1;
                        if output.push(frame(t * 1000 + i, &closes)).is_err() {
                            break;
                        }
                    }
                    created
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(1));
        output.shutdown();
        let created: usize = pushers.into_iter().map(|p| p.join().unwrap()).sum();

        // Accepted frames were released by shutdown, refused ones by push
        assert_eq!(output.buffered(), 0);
        worker.shutdown();
        assert_eq!(closes.load(Ordering::SeqCst), created);
    }

    #[test]
    fn push_after_shutdown_releases_frame() {
        let closes = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(WorkerThread::spawn("output-shutdown").unwrap());
        let (tx, _rx) = flume::unbounded();
        let output = FrameOutput::new(worker, dispatcher(), 2, tx);
        output.shutdown();
        assert!(matches!(
            output.push(frame(1, &closes)),
            Err(SchedulerError::Cancelled)
        ));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(output.buffered(), 0);
    }
}
