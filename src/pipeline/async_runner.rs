//! Deferred processing on a second execution context
//!
//! Only one deferred job runs at a time. While it runs, further requests
//! are refused so the synchronous path never queues work behind a slow job.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::capture::{Frame, FrameError};
use crate::plugin::PluginError;
use crate::scheduler::{ExecutionContext, Job, SchedulerError};
use crate::utils;

#[derive(Debug, Error)]
pub enum AsyncRunError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Schedule(#[from] SchedulerError),
}

/// Clears the busy flag when the job (or the failed schedule) is dropped
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AsyncRunner {
    context: Arc<dyn ExecutionContext>,
    busy: Arc<AtomicBool>,
    refused: AtomicU64,
}

impl AsyncRunner {
    pub fn new(context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            context,
            busy: Arc::new(AtomicBool::new(false)),
            refused: AtomicU64::new(0),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Requests turned away because a job was still running
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    /// Run `job` against `frame` on the async context.
    ///
    /// Returns `Ok(false)` if a previous job is still running. Otherwise the
    /// frame is retained before it crosses over and released once the job
    /// finishes, fails, or panics.
    pub fn run_async<F>(&self, frame: &Frame, job: F) -> Result<bool, AsyncRunError>
    where
        F: FnOnce(&Frame) -> Result<(), PluginError> + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let guard = BusyGuard(self.busy.clone());

        let hold = frame.hold()?;
        let task: Job = Box::new(move || {
            let sequence = hold.sequence();
            match catch_unwind(AssertUnwindSafe(|| job(&hold))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_frame_invalid() => {
                    debug!(sequence, "Deferred job found its frame released");
                }
                Ok(Err(err)) => error!(sequence, "Deferred job failed: {}", err),
                Err(payload) => error!(
                    sequence,
                    "Deferred job panicked: {}",
                    utils::panic_message(payload.as_ref())
                ),
            }
            // Release before admitting the next job
            drop(hold);
            drop(guard);
        });

        self.context.schedule(task)?;
        Ok(true)
    }
}
