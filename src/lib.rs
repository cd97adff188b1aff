pub mod capture;
pub mod config;
pub mod pipeline;
pub mod plugin;
pub mod scheduler;
pub mod utils;

use arc_swap::ArcSwap;
use capture::{Orientation, PixelFormat};
use plugin::{Options, Params};
use serde::{Deserialize, Serialize};

pub use crate::config::ConfigError;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub processing: ProcessingConfig,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub orientation: Orientation,
    /// Front cameras usually deliver mirrored frames
    pub mirrored: bool,
}

/// Where frame processing runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    /// Dedicated worker thread
    #[default]
    Thread,
    /// Blocking pool of the Tokio runtime
    Tokio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub ring_buffer_size: usize,
    pub context: ContextKind,
    pub worker_name: String,
    pub pin_core: Option<usize>,
    /// Run deferred plugins on a second worker
    pub async_worker: bool,
    pub report_queue: usize,
    /// Stop the demo after this many seconds instead of waiting for Ctrl-C
    pub run_for_secs: Option<u64>,
}

/// One plugin instance in the processing chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,
    /// Passed to the plugin factory once
    pub options: Options,
    /// Passed with every frame
    pub params: Params,
    pub target_fps: Option<f64>,
    pub deferred: bool,
}

impl PluginConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuv420,
            orientation: Orientation::Portrait,
            mirrored: false,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 3,
            context: ContextKind::Thread,
            worker_name: "frame-processor".into(),
            pin_core: None,
            async_worker: false,
            report_queue: 64,
            run_for_secs: None,
        }
    }
}

/// Performance metrics collected throughout the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub wakeups: u64,
    pub coalesced_signals: u64,
    pub plugin_failures: u64,
    pub avg_processing_us: f64,
}
