//! Dedicated worker thread execution context

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, error, info};

use super::{ExecutionContext, Job, SchedulerError};
use crate::utils;

/// One OS thread draining a job queue in order.
///
/// Panicking jobs are caught and logged; the thread keeps running. Dropping
/// the worker lets queued jobs finish, then joins the thread.
pub struct WorkerThread {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    panics: Arc<AtomicU64>,
}

impl WorkerThread {
    pub fn spawn(name: impl Into<String>) -> Result<Self, SchedulerError> {
        Self::spawn_pinned(name, None)
    }

    /// Spawn the worker, optionally pinned to a CPU core.
    pub fn spawn_pinned(
        name: impl Into<String>,
        core: Option<usize>,
    ) -> Result<Self, SchedulerError> {
        let name = name.into();
        let (sender, receiver) = flume::unbounded::<Job>();
        let panics = Arc::new(AtomicU64::new(0));

        let thread_name = name.clone();
        let thread_panics = panics.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Some(core) = core {
                    utils::pin_current_thread(core);
                }
                run(&thread_name, receiver, &thread_panics);
            })
            .map_err(|source| SchedulerError::Spawn {
                name: name.clone(),
                source,
            })?;

        info!("Worker thread \"{}\" started", name);
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            panics,
        })
    }

    /// Number of jobs that panicked so far
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, let the queue drain, and join the thread.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Joining ourselves would deadlock; the loop exits on its own
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Worker thread \"{}\" terminated abnormally", self.name);
            }
        }
        info!("Worker thread \"{}\" stopped", self.name);
    }
}

fn run(name: &str, receiver: Receiver<Job>, panics: &AtomicU64) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            panics.fetch_add(1, Ordering::Relaxed);
            error!(
                "Job panicked on worker \"{}\": {}",
                name,
                utils::panic_message(payload.as_ref())
            );
        }
    }
    debug!("Worker \"{}\" queue closed", name);
}

impl ExecutionContext for WorkerThread {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| SchedulerError::ContextClosed(self.name.clone())),
            None => Err(SchedulerError::ContextClosed(self.name.clone())),
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_jobs_in_order_on_named_thread() {
        let worker = WorkerThread::spawn("test-worker").unwrap();
        let (tx, rx) = flume::unbounded();
        for i in 0..5 {
            let tx = tx.clone();
            worker
                .schedule(Box::new(move || {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send((i, name)).unwrap();
                }))
                .unwrap();
        }

        for expected in 0..5 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some("test-worker"));
        }
    }

    #[test]
    fn survives_panicking_job() {
        let worker = WorkerThread::spawn("panicky").unwrap();
        let (tx, rx) = flume::bounded(1);
        worker.schedule(Box::new(|| panic!("plugin exploded"))).unwrap();
        worker.schedule(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(worker.panics(), 1);
    }

    #[test]
    fn shutdown_drains_then_rejects() {
        let worker = WorkerThread::spawn("draining").unwrap();
        let (tx, rx) = flume::unbounded();
        for _ in 0..3 {
            let tx = tx.clone();
            worker.schedule(Box::new(move || tx.send(()).unwrap())).unwrap();
        }
        worker.shutdown();
        assert_eq!(rx.try_iter().count(), 3);
        assert!(matches!(
            worker.schedule(Box::new(|| {})),
            Err(SchedulerError::ContextClosed(_))
        ));
    }
}
