//! Layered configuration: defaults, optional TOML file, `FRAMEPROC__*` env

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::Config;

const ENV_PREFIX: &str = "FRAMEPROC";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Build the configuration from `path` (if given) overlaid with the
    /// environment, e.g. `FRAMEPROC__CAPTURE__FPS=60`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        let loaded: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        debug!("Configuration: {:?}", loaded);
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size {}x{} must be non-zero",
                capture.width, capture.height
            )));
        }
        if capture.fps == 0 {
            return Err(ConfigError::Invalid("capture fps must be non-zero".into()));
        }
        if self.processing.ring_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "ring_buffer_size must be at least 1".into(),
            ));
        }
        if self.processing.report_queue == 0 {
            return Err(ConfigError::Invalid("report_queue must be at least 1".into()));
        }

        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err(ConfigError::Invalid("plugin name must not be empty".into()));
            }
            if let Some(fps) = plugin.target_fps {
                if !fps.is_finite() || fps <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "plugin \"{}\" target_fps {} must be positive",
                        plugin.name, fps
                    )));
                }
            }
        }
        Ok(())
    }
}
