//! Runs the configured plugins against each frame
//!
//! Each plugin invocation is isolated: an error or panic in one plugin is
//! recorded in the [`FrameReport`] and the remaining plugins still run. The
//! dispatcher consumes the frame's hold and releases it on every path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use flume::{Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use super::async_runner::{AsyncRunError, AsyncRunner};
use super::throttle::FpsThrottle;
use crate::capture::{Frame, FrameHold};
use crate::plugin::{FrameProcessorPlugin, Params, PluginError, PluginRegistry, Value};
use crate::utils;
use crate::PluginConfig;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no frame processor plugin named \"{0}\" is registered")]
    UnknownPlugin(String),

    #[error("failed to initialize plugin \"{name}\": {source}")]
    PluginInit {
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("invalid target fps {fps} for plugin \"{name}\"")]
    InvalidTargetFps { name: String, fps: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Throttled,
    /// A deferred run of this plugin's context is still in progress
    AsyncBusy,
}

#[derive(Debug)]
pub enum PluginOutcome {
    Completed(Value),
    /// Handed to the async context; the result arrives in a later report
    Deferred,
    Skipped(SkipReason),
    Failed(PluginError),
}

impl PluginOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&PluginError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PluginResult {
    pub plugin: String,
    pub outcome: PluginOutcome,
}

/// Everything that happened to one frame on one pass
#[derive(Debug)]
pub struct FrameReport {
    pub sequence: u64,
    pub timestamp: Option<u64>,
    pub results: Vec<PluginResult>,
    pub elapsed: Duration,
    /// Produced by the async context rather than the processing pass
    pub deferred: bool,
}

impl FrameReport {
    pub fn outcome(&self, plugin: &str) -> Option<&PluginOutcome> {
        self.results
            .iter()
            .find(|r| r.plugin == plugin)
            .map(|r| &r.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PluginError)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.error().map(|e| (r.plugin.as_str(), e)))
    }
}

type SharedPlugin = Arc<Mutex<Box<dyn FrameProcessorPlugin>>>;

struct PluginSlot {
    name: String,
    plugin: SharedPlugin,
    params: Arc<Params>,
    throttle: Option<FpsThrottle>,
    deferred: bool,
}

struct DeferredSink {
    runner: AsyncRunner,
    reports: Sender<FrameReport>,
}

/// Invoke one plugin with panics caught, logging failures by severity.
fn invoke(name: &str, plugin: &SharedPlugin, frame: &Frame, params: &Params) -> PluginOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut plugin = plugin.lock().unwrap_or_else(PoisonError::into_inner);
        plugin.callback(frame, params)
    }));

    let outcome = match result {
        Ok(Ok(value)) => PluginOutcome::Completed(value),
        Ok(Err(err)) => PluginOutcome::Failed(err),
        Err(payload) => {
            PluginOutcome::Failed(PluginError::Panicked(utils::panic_message(payload.as_ref())))
        }
    };

    if let PluginOutcome::Failed(err) = &outcome {
        if err.is_frame_invalid() {
            debug!(
                plugin = name,
                sequence = frame.sequence(),
                "Frame released before plugin finished"
            );
        } else {
            metrics::counter!("frameproc_plugin_failures").increment(1);
            error!(
                plugin = name,
                sequence = frame.sequence(),
                "Frame processor plugin failed: {}",
                err
            );
        }
    }
    outcome
}

pub(crate) fn send_report(reports: &Sender<FrameReport>, report: FrameReport) {
    match reports.try_send(report) {
        Ok(()) => {}
        Err(TrySendError::Full(report)) => {
            debug!(sequence = report.sequence, "Report queue full, dropping report");
        }
        Err(TrySendError::Disconnected(_)) => trace!("Report receiver gone"),
    }
}

pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    slots: Vec<PluginSlot>,
    deferred: Option<DeferredSink>,
    frames_processed: u64,
}

impl Dispatcher {
    /// Instantiate every configured plugin through `registry`.
    pub fn new(
        registry: Arc<PluginRegistry>,
        plugins: &[PluginConfig],
    ) -> Result<Self, DispatchError> {
        let mut dispatcher = Self {
            registry,
            slots: Vec::with_capacity(plugins.len()),
            deferred: None,
            frames_processed: 0,
        };
        for config in plugins {
            dispatcher.add_plugin(config)?;
        }
        Ok(dispatcher)
    }

    pub fn add_plugin(&mut self, config: &PluginConfig) -> Result<(), DispatchError> {
        let throttle = match config.target_fps {
            None => None,
            Some(fps) if fps.is_finite() && fps > 0.0 => Some(FpsThrottle::new(fps)),
            Some(fps) => {
                return Err(DispatchError::InvalidTargetFps {
                    name: config.name.clone(),
                    fps,
                })
            }
        };

        let plugin = self
            .registry
            .lookup(&config.name, &config.options)
            .map_err(|source| DispatchError::PluginInit {
                name: config.name.clone(),
                source,
            })?
            .ok_or_else(|| DispatchError::UnknownPlugin(config.name.clone()))?;

        debug!("Dispatcher added plugin \"{}\"", config.name);
        self.slots.push(PluginSlot {
            name: config.name.clone(),
            plugin: Arc::new(Mutex::new(plugin)),
            params: Arc::new(config.params.clone()),
            throttle,
            deferred: config.deferred,
        });
        Ok(())
    }

    /// Route deferred plugins to `runner`; their results are sent to
    /// `reports` as separate reports.
    pub fn set_async_runner(&mut self, runner: AsyncRunner, reports: Sender<FrameReport>) {
        self.deferred = Some(DeferredSink { runner, reports });
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Run every plugin against the held frame, then release the hold.
    #[instrument(skip_all, fields(sequence = frame.sequence()))]
    pub fn process(&mut self, frame: FrameHold) -> FrameReport {
        let started = Instant::now();
        let timestamp = frame.timestamp().ok();
        let mut results = Vec::with_capacity(self.slots.len());

        for slot in &mut self.slots {
            if let (Some(throttle), Some(ts)) = (slot.throttle.as_mut(), timestamp) {
                if !throttle.should_run(ts) {
                    results.push(PluginResult {
                        plugin: slot.name.clone(),
                        outcome: PluginOutcome::Skipped(SkipReason::Throttled),
                    });
                    continue;
                }
            }

            let outcome = match (slot.deferred, self.deferred.as_ref()) {
                (true, Some(sink)) => Self::defer(slot, sink, &frame),
                (true, None) => {
                    warn!(
                        plugin = slot.name.as_str(),
                        "No async context configured, running deferred plugin inline"
                    );
                    invoke(&slot.name, &slot.plugin, &frame, &slot.params)
                }
                (false, _) => invoke(&slot.name, &slot.plugin, &frame, &slot.params),
            };
            results.push(PluginResult {
                plugin: slot.name.clone(),
                outcome,
            });
        }

        let sequence = frame.sequence();
        frame.release();
        self.frames_processed += 1;

        let elapsed = started.elapsed();
        trace!(?elapsed, "Frame processed");
        FrameReport {
            sequence,
            timestamp,
            results,
            elapsed,
            deferred: false,
        }
    }

    fn defer(slot: &PluginSlot, sink: &DeferredSink, frame: &Frame) -> PluginOutcome {
        let name = slot.name.clone();
        let plugin = slot.plugin.clone();
        let params = slot.params.clone();
        let reports = sink.reports.clone();

        let scheduled = sink.runner.run_async(frame, move |frame| {
            let started = Instant::now();
            let outcome = invoke(&name, &plugin, frame, &params);
            send_report(
                &reports,
                FrameReport {
                    sequence: frame.sequence(),
                    timestamp: frame.timestamp().ok(),
                    results: vec![PluginResult {
                        plugin: name,
                        outcome,
                    }],
                    elapsed: started.elapsed(),
                    deferred: true,
                },
            );
            Ok(())
        });

        match scheduled {
            Ok(true) => PluginOutcome::Deferred,
            Ok(false) => PluginOutcome::Skipped(SkipReason::AsyncBusy),
            Err(AsyncRunError::Frame(err)) => PluginOutcome::Failed(err.into()),
            Err(AsyncRunError::Schedule(err)) => {
                error!(plugin = slot.name.as_str(), "Failed to defer plugin: {}", err);
                PluginOutcome::Failed(PluginError::callback(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, Orientation, PixelFormat, SyntheticBuffer};
    use crate::plugin::builtin::{register_builtin, EXAMPLE_PLUGIN, LUMA_STATS_PLUGIN};
    use crate::plugin::Options;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame_at(sequence: u64, timestamp: u64, closes: &Arc<AtomicUsize>) -> FrameHold {
        let meta = FrameMetadata {
            sequence,
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Yuv420,
            orientation: Orientation::Portrait,
            is_mirrored: false,
            timestamp,
        };
        let buffer =
            SyntheticBuffer::new(4, 4, PixelFormat::Yuv420, 0).with_close_counter(closes.clone());
        FrameHold::adopt(Frame::new(buffer, meta))
    }

    fn plugin(name: &str) -> PluginConfig {
        PluginConfig::named(name)
    }

    fn registry() -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new());
        register_builtin(&registry).unwrap();
        registry
            .register("fails", |_: &Options| {
                Ok(|_: &Frame, _: &Params| -> Result<Value, PluginError> {
                    Err(PluginError::callback("model not loaded"))
                })
            })
            .unwrap();
        registry
            .register("panics", |_: &Options| {
                Ok(|_: &Frame, _: &Params| -> Result<Value, PluginError> {
                    panic!("index out of bounds")
                })
            })
            .unwrap();
        registry
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let err = Dispatcher::new(registry(), &[plugin("nonexistent")])
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::UnknownPlugin(name) if name == "nonexistent"));
    }

    #[test]
    fn factory_failure_is_reported() {
        let mut config = plugin(LUMA_STATS_PLUGIN);
        config.options.insert("sample_step".into(), Value::Int(-1));
        let err = Dispatcher::new(registry(), &[config]).err().unwrap();
        assert!(matches!(err, DispatchError::PluginInit { .. }));
    }

    #[test]
    fn invalid_target_fps_is_rejected() {
        let mut config = plugin(EXAMPLE_PLUGIN);
        config.target_fps = Some(0.0);
        assert!(matches!(
            Dispatcher::new(registry(), &[config]),
            Err(DispatchError::InvalidTargetFps { .. })
        ));
    }

    #[test]
    fn failing_plugins_do_not_block_others() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new(
            registry(),
            &[plugin("fails"), plugin("panics"), plugin(EXAMPLE_PLUGIN)],
        )
        .unwrap();

        let report = dispatcher.process(frame_at(1, 0, &closes));
        assert_eq!(report.results.len(), 3);
        assert!(matches!(
            report.outcome("fails"),
            Some(PluginOutcome::Failed(PluginError::Callback(_)))
        ));
        assert!(matches!(
            report.outcome("panics"),
            Some(PluginOutcome::Failed(PluginError::Panicked(msg))) if msg == "index out of bounds"
        ));
        assert!(report
            .outcome(EXAMPLE_PLUGIN)
            .and_then(PluginOutcome::value)
            .is_some());
        assert_eq!(report.failures().count(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn plugin_can_retain_frame_past_callback() {
        let closes = Arc::new(AtomicUsize::new(0));
        let kept: Arc<Mutex<Vec<FrameHold>>> = Arc::default();
        let registry = Arc::new(PluginRegistry::new());
        let store = kept.clone();
        registry
            .register("keeper", move |_: &Options| {
                let store = store.clone();
                Ok(move |frame: &Frame, _: &Params| -> Result<Value, PluginError> {
                    store.lock().unwrap().push(frame.hold()?);
                    Ok(Value::Null)
                })
            })
            .unwrap();

        let mut dispatcher = Dispatcher::new(registry, &[plugin("keeper")]).unwrap();
        dispatcher.process(frame_at(1, 0, &closes));
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        let held = kept.lock().unwrap().pop().unwrap();
        assert_eq!(held.width().unwrap(), 4);
        drop(held);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn throttled_plugin_is_skipped() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut config = plugin(EXAMPLE_PLUGIN);
        config.target_fps = Some(10.0);
        let mut dispatcher = Dispatcher::new(registry(), &[config]).unwrap();

        let first = dispatcher.process(frame_at(1, 0, &closes));
        let second = dispatcher.process(frame_at(2, 16_000_000, &closes));
        let third = dispatcher.process(frame_at(3, 120_000_000, &closes));
        assert!(matches!(
            first.outcome(EXAMPLE_PLUGIN),
            Some(PluginOutcome::Completed(_))
        ));
        assert!(matches!(
            second.outcome(EXAMPLE_PLUGIN),
            Some(PluginOutcome::Skipped(SkipReason::Throttled))
        ));
        assert!(matches!(
            third.outcome(EXAMPLE_PLUGIN),
            Some(PluginOutcome::Completed(_))
        ));
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.frames_processed(), 3);
    }

    #[test]
    fn params_reach_plugin() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut config = plugin(LUMA_STATS_PLUGIN);
        config.params.insert("histogram".into(), Value::Bool(false));
        let mut dispatcher = Dispatcher::new(registry(), &[config]).unwrap();
        let report = dispatcher.process(frame_at(1, 0, &closes));
        let value = report
            .outcome(LUMA_STATS_PLUGIN)
            .and_then(PluginOutcome::value)
            .unwrap();
        assert!(value.get("histogram").is_none());
        assert!(value.get("mean").is_some());
    }

    #[test]
    fn deferred_plugin_without_runner_runs_inline() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut config = plugin(EXAMPLE_PLUGIN);
        config.deferred = true;
        let mut dispatcher = Dispatcher::new(registry(), &[config]).unwrap();
        let report = dispatcher.process(frame_at(1, 0, &closes));
        assert!(matches!(
            report.outcome(EXAMPLE_PLUGIN),
            Some(PluginOutcome::Completed(_))
        ));
    }
}
