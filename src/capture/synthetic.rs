//! Heap-backed capture source
//!
//! Produces frames with a moving test pattern at a fixed rate. Stands in for
//! a platform capture layer in the demo binary and in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, instrument};

use crate::capture::frame::{
    Frame, FrameMetadata, HardwareBufferHandle, NativeBuffer, Orientation, PixelFormat, PlaneRef,
};
use crate::CaptureConfig;

struct Plane {
    data: Bytes,
    bytes_per_row: usize,
}

/// Native buffer backed by heap memory, counting how often it is closed
pub struct SyntheticBuffer {
    planes: Vec<Plane>,
    released: AtomicBool,
    closes: Arc<AtomicUsize>,
    hardware: Option<HardwareBufferHandle>,
}

impl SyntheticBuffer {
    /// Allocate planes matching `format`, filled with a diagonal gradient
    /// offset by `phase`.
    pub fn new(width: u32, height: u32, format: PixelFormat, phase: u8) -> Self {
        let (w, h) = (width as usize, height as usize);
        let planes = match format {
            PixelFormat::Yuv420 => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                vec![
                    gradient_plane(w, h, 1, phase),
                    flat_plane(cw, ch, 128),
                    flat_plane(cw, ch, 128),
                ]
            }
            PixelFormat::Yuv422 => vec![gradient_plane(w, h, 2, phase)],
            PixelFormat::Rgba => vec![gradient_plane(w, h, 4, phase)],
            PixelFormat::Rgb => vec![gradient_plane(w, h, 3, phase)],
            PixelFormat::Jpeg | PixelFormat::Unknown => vec![gradient_plane(w, h, 1, phase)],
        };

        Self {
            planes,
            released: AtomicBool::new(false),
            closes: Arc::new(AtomicUsize::new(0)),
            hardware: None,
        }
    }

    /// Share a close counter across many buffers.
    pub fn with_close_counter(mut self, closes: Arc<AtomicUsize>) -> Self {
        self.closes = closes;
        self
    }

    pub fn with_hardware_buffer(mut self, handle: HardwareBufferHandle) -> Self {
        self.hardware = Some(handle);
        self
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

fn gradient_plane(width: usize, height: usize, bytes_per_pixel: usize, phase: u8) -> Plane {
    let bytes_per_row = width * bytes_per_pixel;
    let mut data = BytesMut::with_capacity(bytes_per_row * height);
    for y in 0..height {
        for x in 0..width {
            let value = (x + y) as u8 ^ phase;
            data.put_bytes(value, bytes_per_pixel);
        }
    }
    Plane {
        data: data.freeze(),
        bytes_per_row,
    }
}

fn flat_plane(width: usize, height: usize, value: u8) -> Plane {
    let mut data = BytesMut::with_capacity(width * height);
    data.put_bytes(value, width * height);
    Plane {
        data: data.freeze(),
        bytes_per_row: width,
    }
}

impl NativeBuffer for SyntheticBuffer {
    fn plane_count(&self) -> usize {
        self.planes.len()
    }

    fn plane(&self, index: usize) -> Option<PlaneRef<'_>> {
        self.planes.get(index).map(|p| PlaneRef {
            data: &p.data,
            bytes_per_row: p.bytes_per_row,
        })
    }

    fn hardware_buffer(&self) -> Option<HardwareBufferHandle> {
        self.hardware
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.released.store(true, Ordering::Release);
        self.closes.fetch_add(1, Ordering::AcqRel);
    }
}

/// Fixed-rate synthetic camera
pub struct SyntheticCapture {
    config: CaptureConfig,
    sequence: u64,
    started: Instant,
    closes: Arc<AtomicUsize>,
}

impl SyntheticCapture {
    pub fn new(config: CaptureConfig) -> Self {
        info!(
            "Initializing synthetic capture: {}x{} {} @ {} fps",
            config.width, config.height, config.format, config.fps
        );
        Self {
            config,
            sequence: 0,
            started: Instant::now(),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of buffers returned to this source so far
    pub fn buffers_closed(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }

    pub fn frames_captured(&self) -> u64 {
        self.sequence
    }

    /// Produce the next frame, starting with one hold owned by the caller.
    pub fn capture_frame(&mut self) -> Frame {
        self.sequence += 1;
        let buffer = SyntheticBuffer::new(
            self.config.width,
            self.config.height,
            self.config.format,
            self.sequence as u8,
        )
        .with_close_counter(self.closes.clone());

        let meta = FrameMetadata {
            sequence: self.sequence,
            width: self.config.width,
            height: self.config.height,
            pixel_format: self.config.format,
            orientation: self.config.orientation,
            is_mirrored: self.config.mirrored,
            timestamp: self.started.elapsed().as_nanos() as u64,
        };
        Frame::new(buffer, meta)
    }

    /// Capture at the configured rate, handing each frame to `sink`, until
    /// `stop` is set or `sink` returns `false`.
    #[instrument(skip_all)]
    pub fn run(&mut self, stop: &AtomicBool, mut sink: impl FnMut(Frame) -> bool) {
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.config.fps.max(1)));
        let mut next = Instant::now();

        while !stop.load(Ordering::Acquire) {
            let frame = self.capture_frame();
            if !sink(frame) {
                debug!("Frame sink closed, stopping capture");
                break;
            }

            next += interval;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else {
                next = now;
            }
        }

        info!("Synthetic capture stopped after {} frames", self.sequence);
    }
}
