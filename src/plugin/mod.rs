//! Frame processor plugins
//!
//! A plugin is anything implementing [`FrameProcessorPlugin`]. Plugins are
//! constructed by name through the [`PluginRegistry`] and invoked once per
//! frame by the [`Dispatcher`](crate::pipeline::Dispatcher).

pub mod builtin;
pub mod registry;
pub mod value;

use std::error::Error as StdError;

use thiserror::Error;

use crate::capture::{Frame, FrameError};

pub use registry::{PluginFactory, PluginRegistry, RegistryError};
pub use value::{Options, Params, SharedArray, Value};

/// Failure of a single plugin construction or invocation
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("plugin callback failed: {0}")]
    Callback(#[source] Box<dyn StdError + Send + Sync>),

    #[error("plugin panicked: {0}")]
    Panicked(String),
}

impl PluginError {
    pub fn callback(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Callback(err.into())
    }

    pub fn invalid_param(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// The frame was released underneath the plugin. Expected under load.
    pub fn is_frame_invalid(&self) -> bool {
        matches!(self, Self::Frame(FrameError::Invalid))
    }
}

/// A unit of per-frame processing.
///
/// The frame is valid for at least the duration of the call. To use it
/// afterwards, take a [`FrameHold`](crate::capture::FrameHold) with
/// [`Frame::hold`] before returning.
pub trait FrameProcessorPlugin: Send {
    fn callback(&mut self, frame: &Frame, params: &Params) -> Result<Value, PluginError>;
}

impl<F> FrameProcessorPlugin for F
where
    F: FnMut(&Frame, &Params) -> Result<Value, PluginError> + Send,
{
    fn callback(&mut self, frame: &Frame, params: &Params) -> Result<Value, PluginError> {
        self(frame, params)
    }
}
