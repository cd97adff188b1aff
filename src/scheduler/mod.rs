//! Coalescing cross-thread trigger
//!
//! The capture thread calls [`Scheduler::signal`] once per frame. The
//! scheduler keeps a single pending flag: the first signal of a burst
//! schedules one wake-up on the target [`ExecutionContext`], later signals
//! collapse into it. The wake-up clears the flag before running the handler,
//! so a signal raised while the handler runs schedules exactly one more.

pub mod runtime;
pub mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use thiserror::Error;
use tracing::{debug, trace};

pub use runtime::TokioContext;
pub use worker::WorkerThread;

/// Unit of work run on an execution context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("execution context \"{0}\" is shut down")]
    ContextClosed(String),

    #[error("scheduler has been cancelled")]
    Cancelled,

    #[error("failed to spawn worker thread \"{name}\": {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Somewhere jobs can be run, typically a dedicated processing thread
pub trait ExecutionContext: Send + Sync {
    fn name(&self) -> &str;

    /// Queue `job` without blocking the caller. On error the job is dropped
    /// without running.
    fn schedule(&self, job: Job) -> Result<(), SchedulerError>;
}

#[derive(Default)]
struct Counters {
    signals: AtomicU64,
    coalesced: AtomicU64,
    wakeups: AtomicU64,
    cancelled_wakeups: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub signals: u64,
    /// Signals absorbed by an already pending wake-up
    pub coalesced: u64,
    pub wakeups: u64,
    /// Wake-ups that ran after cancellation and were skipped
    pub cancelled_wakeups: u64,
}

struct Inner {
    pending: CachePadded<AtomicBool>,
    cancelled: AtomicBool,
    handler: Box<dyn Fn() + Send + Sync>,
    counters: CachePadded<Counters>,
}

impl Inner {
    fn wake(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.counters
                .cancelled_wakeups
                .fetch_add(1, Ordering::Relaxed);
            trace!("Skipping wake-up on cancelled scheduler");
            return;
        }

        // Clear first: a signal from here on must schedule a new wake-up
        self.pending.swap(false, Ordering::AcqRel);
        self.counters.wakeups.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frameproc_wakeups").increment(1);
        (self.handler)();
    }
}

/// Trigger marshaling from a producer thread to an execution context
pub struct Scheduler {
    inner: Arc<Inner>,
    context: Arc<dyn ExecutionContext>,
}

impl Scheduler {
    /// `handler` runs on `context` once per wake-up.
    pub fn new(
        context: Arc<dyn ExecutionContext>,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        debug!("Scheduler targeting \"{}\"", context.name());
        Self {
            inner: Arc::new(Inner {
                pending: CachePadded::new(AtomicBool::new(false)),
                cancelled: AtomicBool::new(false),
                handler: Box::new(handler),
                counters: CachePadded::new(Counters::default()),
            }),
            context,
        }
    }

    /// Request a wake-up. Returns `true` if this call scheduled one and
    /// `false` if it was coalesced into a pending wake-up.
    pub fn signal(&self) -> Result<bool, SchedulerError> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(SchedulerError::Cancelled);
        }

        let counters = &self.inner.counters;
        counters.signals.fetch_add(1, Ordering::Relaxed);

        if self.inner.pending.swap(true, Ordering::AcqRel) {
            counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let job: Job = Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.wake();
            }
        });

        if let Err(err) = self.context.schedule(job) {
            self.inner.pending.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(true)
    }

    /// Drop any pending wake-up. Wake-ups already queued on the context
    /// become no-ops and further signals are rejected.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            debug!("Scheduler for \"{}\" cancelled", self.context.name());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            signals: c.signals.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            wakeups: c.wakeups.load(Ordering::Relaxed),
            cancelled_wakeups: c.cancelled_wakeups.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("context", &self.context.name())
            .field("pending", &self.is_pending())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Queues jobs until the test drains them
    #[derive(Default)]
    struct ManualContext {
        jobs: Mutex<VecDeque<Job>>,
        closed: AtomicBool,
    }

    impl ManualContext {
        fn queued(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }

        fn run_one(&self) -> bool {
            let job = self.jobs.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job();
                    true
                }
                None => false,
            }
        }

        fn drain(&self) -> usize {
            let mut ran = 0;
            while self.run_one() {
                ran += 1;
            }
            ran
        }
    }

    impl ExecutionContext for ManualContext {
        fn name(&self) -> &str {
            "manual"
        }

        fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(SchedulerError::ContextClosed("manual".into()));
            }
            self.jobs.lock().unwrap().push_back(job);
            Ok(())
        }
    }

    fn counting_scheduler() -> (Arc<ManualContext>, Scheduler, Arc<AtomicUsize>) {
        let context = Arc::new(ManualContext::default());
        let wakeups = Arc::new(AtomicUsize::new(0));
        let counter = wakeups.clone();
        let scheduler = Scheduler::new(context.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (context, scheduler, wakeups)
    }

    #[test]
    fn burst_of_signals_coalesces_into_one_wakeup() {
        let (context, scheduler, wakeups) = counting_scheduler();
        assert!(scheduler.signal().unwrap());
        for _ in 1..100 {
            assert!(!scheduler.signal().unwrap());
        }
        assert_eq!(context.queued(), 1);
        assert_eq!(context.drain(), 1);
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.signals, 100);
        assert_eq!(stats.coalesced, 99);
        assert_eq!(stats.wakeups, 1);
    }

    #[test]
    fn signal_after_wakeup_schedules_again() {
        let (context, scheduler, wakeups) = counting_scheduler();
        scheduler.signal().unwrap();
        context.drain();
        assert!(!scheduler.is_pending());

        assert!(scheduler.signal().unwrap());
        assert_eq!(context.drain(), 1);
        assert_eq!(wakeups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signal_during_handler_is_not_lost() {
        let context = Arc::new(ManualContext::default());
        let slot: Arc<Mutex<Option<Arc<Scheduler>>>> = Arc::new(Mutex::new(None));
        let wakeups = Arc::new(AtomicUsize::new(0));

        let handler_slot = slot.clone();
        let counter = wakeups.clone();
        let scheduler = Arc::new(Scheduler::new(context.clone(), move || {
            // New frame arrives while this one is being processed
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let scheduler = handler_slot.lock().unwrap().clone().unwrap();
                assert!(scheduler.signal().unwrap());
                assert!(!scheduler.signal().unwrap());
            }
        }));
        *slot.lock().unwrap() = Some(scheduler.clone());

        scheduler.signal().unwrap();
        assert!(context.run_one());
        assert_eq!(context.queued(), 1);
        assert_eq!(context.drain(), 1);
        assert_eq!(wakeups.load(Ordering::SeqCst), 2);

        slot.lock().unwrap().take();
    }

    #[test]
    fn cancelled_scheduler_skips_pending_wakeup() {
        let (context, scheduler, wakeups) = counting_scheduler();
        scheduler.signal().unwrap();
        scheduler.cancel();
        assert!(matches!(scheduler.signal(), Err(SchedulerError::Cancelled)));
        context.drain();
        assert_eq!(wakeups.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().cancelled_wakeups, 1);
    }

    #[test]
    fn dropped_scheduler_leaves_inert_jobs() {
        let (context, scheduler, wakeups) = counting_scheduler();
        scheduler.signal().unwrap();
        drop(scheduler);
        assert_eq!(context.drain(), 1);
        assert_eq!(wakeups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_schedule_clears_pending() {
        let (context, scheduler, wakeups) = counting_scheduler();
        context.closed.store(true, Ordering::Release);
        assert!(matches!(
            scheduler.signal(),
            Err(SchedulerError::ContextClosed(_))
        ));
        assert!(!scheduler.is_pending());

        context.closed.store(false, Ordering::Release);
        assert!(scheduler.signal().unwrap());
        context.drain();
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
    }
}
