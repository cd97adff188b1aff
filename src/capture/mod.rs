pub mod frame;
pub mod synthetic;

pub use frame::{
    BufferView, Frame, FrameError, FrameHold, FrameMetadata, FrameState, HardwareBufferHandle,
    NativeBuffer, Orientation, PixelFormat, PlaneRef, Release,
};
pub use synthetic::{SyntheticBuffer, SyntheticCapture};
