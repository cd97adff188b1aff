//! Execution context backed by a Tokio runtime's blocking pool

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;
use tracing::debug;

use super::{ExecutionContext, Job, SchedulerError};

/// Runs jobs with `spawn_blocking`, so slow plugins never stall async tasks.
pub struct TokioContext {
    name: String,
    handle: Handle,
    closed: AtomicBool,
}

impl TokioContext {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
            closed: AtomicBool::new(false),
        }
    }

    /// Bind to the runtime of the calling task, if any.
    pub fn current(name: impl Into<String>) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::new(name, handle))
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Tokio context \"{}\" closed", self.name);
        }
    }
}

impl ExecutionContext for TokioContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::ContextClosed(self.name.clone()));
        }
        // Detached; panics surface through the discarded JoinHandle
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}
