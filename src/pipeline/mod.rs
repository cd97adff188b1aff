pub mod async_runner;
pub mod dispatcher;
pub mod output;
pub mod ringbuf;
pub mod throttle;

pub use async_runner::{AsyncRunError, AsyncRunner};
pub use dispatcher::{
    DispatchError, Dispatcher, FrameReport, PluginOutcome, PluginResult, SkipReason,
};
pub use output::FrameOutput;
pub use ringbuf::{FrameRingBuffer, RingStats};
pub use throttle::FpsThrottle;
