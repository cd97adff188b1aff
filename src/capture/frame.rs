//! Reference-counted frame wrapper around a capture-layer image buffer
//!
//! A [`Frame`] owns exactly one [`NativeBuffer`] and closes it exactly once,
//! when the last hold is released. Holders use [`Frame::retain`] and
//! [`Frame::release`] directly, or the RAII [`FrameHold`] which releases on
//! drop. Every accessor re-checks validity under the per-frame lock.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::plugin::SharedArray;

/// Errors raised by frame accessors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is invalid: its buffer has already been released")]
    Invalid,

    #[error("hardware buffers are not available on this platform")]
    HardwareBufferUnavailable,

    #[error("plane {index} out of range (frame has {count} planes)")]
    PlaneOutOfRange { index: usize, count: usize },

    #[error("frame reference count overflow")]
    RefCountOverflow,
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Pixel formats a capture layer can hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelFormat {
    Yuv420,
    Yuv422,
    Rgba,
    Rgb,
    Jpeg,
    Unknown,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yuv420 => "yuv420",
            Self::Yuv422 => "yuv422",
            Self::Rgba => "rgba",
            Self::Rgb => "rgb",
            Self::Jpeg => "jpeg",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Physical orientation of the frame contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    #[default]
    Portrait,
    LandscapeRight,
    PortraitUpsideDown,
    LandscapeLeft,
}

impl Orientation {
    pub fn to_degrees(self) -> u32 {
        match self {
            Self::Portrait => 0,
            Self::LandscapeLeft => 90,
            Self::PortraitUpsideDown => 180,
            Self::LandscapeRight => 270,
        }
    }

    /// Snap an arbitrary rotation to the nearest cardinal orientation.
    pub fn from_rotation_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            45..=134 => Self::LandscapeLeft,
            135..=224 => Self::PortraitUpsideDown,
            225..=314 => Self::LandscapeRight,
            _ => Self::Portrait,
        }
    }

    /// Capture layers report the rotation needed to make the image upright;
    /// the frame orientation is the inverse of that.
    pub fn reversed(self) -> Self {
        match self {
            Self::LandscapeLeft => Self::LandscapeRight,
            Self::LandscapeRight => Self::LandscapeLeft,
            other => other,
        }
    }
}

/// Metadata supplied by the capture layer alongside the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub orientation: Orientation,
    pub is_mirrored: bool,
    /// Monotonic capture timestamp in nanoseconds
    pub timestamp: u64,
}

/// One plane of native pixel memory
#[derive(Debug, Clone, Copy)]
pub struct PlaneRef<'a> {
    pub data: &'a [u8],
    pub bytes_per_row: usize,
}

/// Opaque GPU-mappable handle (AHardwareBuffer pointer, dma-buf fd, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareBufferHandle(pub u64);

/// Capture-layer image buffer owned by a [`Frame`].
///
/// Nothing but the owning frame may call [`NativeBuffer::close`].
pub trait NativeBuffer: Send + Sync {
    fn plane_count(&self) -> usize;

    fn plane(&self, index: usize) -> Option<PlaneRef<'_>>;

    /// `None` when the platform cannot provide hardware buffers.
    fn hardware_buffer(&self) -> Option<HardwareBufferHandle> {
        None
    }

    /// Best-effort check; must not have side effects.
    fn is_released(&self) -> bool;

    /// Return the buffer to the capture layer. Called exactly once.
    fn close(&self);
}

/// Externally observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Live,
    /// The close hook was entered but never returned.
    Closing,
    Closed,
}

/// Result of a [`Frame::release`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other holders remain.
    Retained(usize),
    /// This call dropped the last hold and closed the buffer.
    Closed,
    /// The buffer was already closed; the call was a no-op.
    AlreadyClosed,
}

struct RefState {
    count: usize,
    state: FrameState,
}

struct Shared {
    meta: FrameMetadata,
    buffer: Box<dyn NativeBuffer>,
    refs: Mutex<RefState>,
    hardware_buffer: OnceCell<HardwareBufferHandle>,
    pixels: OnceCell<SharedArray>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let refs = self.refs.get_mut().unwrap_or_else(PoisonError::into_inner);
        if refs.state == FrameState::Live {
            warn!(
                sequence = self.meta.sequence,
                outstanding = refs.count,
                "Frame dropped with outstanding holds, closing buffer"
            );
            refs.state = FrameState::Closing;
            self.buffer.close();
            refs.state = FrameState::Closed;
        }
    }
}

/// Shared handle to a captured frame.
///
/// Cloning the handle does not retain the frame; only [`Frame::retain`] and
/// [`Frame::hold`] count as holds.
#[derive(Clone)]
pub struct Frame {
    shared: Arc<Shared>,
}

impl Frame {
    /// Wrap a freshly captured buffer. The frame starts with one hold,
    /// owned by whoever dispatches it.
    pub fn new<B: NativeBuffer + 'static>(buffer: B, meta: FrameMetadata) -> Self {
        Self::from_boxed(Box::new(buffer), meta)
    }

    pub fn from_boxed(buffer: Box<dyn NativeBuffer>, meta: FrameMetadata) -> Self {
        trace!(sequence = meta.sequence, "Frame created");
        Self {
            shared: Arc::new(Shared {
                meta,
                buffer,
                refs: Mutex::new(RefState {
                    count: 1,
                    state: FrameState::Live,
                }),
                hardware_buffer: OnceCell::new(),
                pixels: OnceCell::new(),
            }),
        }
    }

    fn refs(&self) -> MutexGuard<'_, RefState> {
        self.shared
            .refs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_usable(&self, refs: &RefState) -> bool {
        refs.state == FrameState::Live && refs.count > 0 && !self.shared.buffer.is_released()
    }

    /// Run `f` against the buffer while holding the frame lock, so close
    /// cannot interleave with the read.
    fn with_buffer<T>(&self, f: impl FnOnce(&dyn NativeBuffer) -> T) -> Result<T> {
        let refs = self.refs();
        if !self.is_usable(&refs) {
            return Err(FrameError::Invalid);
        }
        Ok(f(self.shared.buffer.as_ref()))
    }

    fn meta_field<T>(&self, f: impl FnOnce(&FrameMetadata) -> T) -> Result<T> {
        self.with_buffer(|_| f(&self.shared.meta))
    }

    pub fn is_valid(&self) -> bool {
        let refs = self.refs();
        self.is_usable(&refs)
    }

    pub fn width(&self) -> Result<u32> {
        self.meta_field(|m| m.width)
    }

    pub fn height(&self) -> Result<u32> {
        self.meta_field(|m| m.height)
    }

    pub fn is_mirrored(&self) -> Result<bool> {
        self.meta_field(|m| m.is_mirrored)
    }

    pub fn timestamp(&self) -> Result<u64> {
        self.meta_field(|m| m.timestamp)
    }

    pub fn orientation(&self) -> Result<Orientation> {
        self.meta_field(|m| m.orientation)
    }

    pub fn pixel_format(&self) -> Result<PixelFormat> {
        self.meta_field(|m| m.pixel_format)
    }

    pub fn metadata(&self) -> Result<FrameMetadata> {
        self.meta_field(|m| *m)
    }

    /// Capture sequence number. Always available, for logging.
    pub fn sequence(&self) -> u64 {
        self.shared.meta.sequence
    }

    pub fn plane_count(&self) -> Result<usize> {
        self.with_buffer(|b| b.plane_count())
    }

    pub fn bytes_per_row(&self, plane: usize) -> Result<usize> {
        self.with_buffer(|b| {
            b.plane(plane)
                .map(|p| p.bytes_per_row)
                .ok_or(FrameError::PlaneOutOfRange {
                    index: plane,
                    count: b.plane_count(),
                })
        })?
    }

    /// Zero-copy view over one plane. The view keeps its own hold, so the
    /// buffer stays open until the view is dropped.
    pub fn buffer_view(&self, plane: usize) -> Result<BufferView<'_>> {
        let hold = self.hold()?;
        if !self.is_valid() {
            return Err(FrameError::Invalid);
        }
        let Some(plane_ref) = self.shared.buffer.plane(plane) else {
            return Err(FrameError::PlaneOutOfRange {
                index: plane,
                count: self.shared.buffer.plane_count(),
            });
        };
        Ok(BufferView {
            data: plane_ref.data,
            bytes_per_row: plane_ref.bytes_per_row,
            _hold: hold,
        })
    }

    /// Cached after the first successful lookup.
    pub fn hardware_buffer_handle(&self) -> Result<HardwareBufferHandle> {
        self.with_buffer(|b| {
            self.shared
                .hardware_buffer
                .get_or_try_init(|| {
                    b.hardware_buffer()
                        .ok_or(FrameError::HardwareBufferUnavailable)
                })
                .copied()
        })?
    }

    /// Copy every plane, in order, into a buffer that stays readable after
    /// the frame is closed. The copy is made once and shared afterwards.
    pub fn to_shared_array(&self) -> Result<SharedArray> {
        self.with_buffer(|b| {
            self.shared
                .pixels
                .get_or_init(|| {
                    let planes: Vec<&[u8]> = (0..b.plane_count())
                        .filter_map(|i| b.plane(i))
                        .map(|p| p.data)
                        .collect();
                    let size = planes.iter().map(|p| p.len()).sum();
                    trace!(sequence = self.sequence(), size, "Copying frame pixels");
                    SharedArray::build(size, |buf| {
                        let mut offset = 0;
                        for data in planes {
                            buf[offset..offset + data.len()].copy_from_slice(data);
                            offset += data.len();
                        }
                    })
                })
                .clone()
        })
    }

    /// Add a hold. Fails only once the buffer has been closed, leaving the
    /// count untouched.
    pub fn retain(&self) -> Result<usize> {
        let mut refs = self.refs();
        if refs.state != FrameState::Live {
            return Err(FrameError::Invalid);
        }
        refs.count = refs
            .count
            .checked_add(1)
            .ok_or(FrameError::RefCountOverflow)?;
        trace!(sequence = self.sequence(), count = refs.count, "Frame retained");
        Ok(refs.count)
    }

    /// Drop a hold, closing the buffer on the last one. Releasing a closed
    /// frame is a no-op reported as [`Release::AlreadyClosed`].
    pub fn release(&self) -> Release {
        let mut refs = self.refs();
        if refs.state != FrameState::Live {
            debug!(sequence = self.sequence(), "Release on closed frame ignored");
            return Release::AlreadyClosed;
        }

        // Live implies count >= 1
        refs.count -= 1;
        if refs.count > 0 {
            trace!(sequence = self.sequence(), count = refs.count, "Frame released");
            return Release::Retained(refs.count);
        }

        refs.state = FrameState::Closing;
        self.shared.buffer.close();
        refs.state = FrameState::Closed;
        trace!(sequence = self.sequence(), "Frame closed");
        Release::Closed
    }

    /// Retain and wrap the new hold in a guard.
    pub fn hold(&self) -> Result<FrameHold> {
        self.retain()?;
        Ok(FrameHold::adopt(self.clone()))
    }

    pub fn ref_count(&self) -> usize {
        self.refs().count
    }

    pub fn state(&self) -> FrameState {
        self.refs().state
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refs = self.refs();
        f.debug_struct("Frame")
            .field("sequence", &self.shared.meta.sequence)
            .field("state", &refs.state)
            .field("ref_count", &refs.count)
            .finish()
    }
}

/// One counted hold on a frame, released on drop.
pub struct FrameHold {
    frame: Frame,
    released: bool,
}

impl FrameHold {
    /// Take ownership of a hold the caller already has, typically the one a
    /// new frame is created with.
    pub fn adopt(frame: Frame) -> Self {
        Self {
            frame,
            released: false,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn release(mut self) -> Release {
        self.released = true;
        self.frame.release()
    }
}

impl Deref for FrameHold {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for FrameHold {
    fn drop(&mut self) {
        if !self.released {
            self.frame.release();
        }
    }
}

impl fmt::Debug for FrameHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameHold").field(&self.frame).finish()
    }
}

/// Borrowed plane memory, valid while the view exists
pub struct BufferView<'a> {
    data: &'a [u8],
    bytes_per_row: usize,
    _hold: FrameHold,
}

impl BufferView<'_> {
    pub fn bytes_per_row(&self) -> usize {
        self.bytes_per_row
    }
}

impl Deref for BufferView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl fmt::Debug for BufferView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("len", &self.data.len())
            .field("bytes_per_row", &self.bytes_per_row)
            .finish()
    }
}
