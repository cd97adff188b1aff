//! Plugins shipped with the crate

use std::collections::BTreeMap;

use tracing::debug;

use super::{FrameProcessorPlugin, Options, Params, PluginError, PluginRegistry, RegistryError};
use super::{SharedArray, Value};
use crate::capture::{Frame, PixelFormat};

pub const EXAMPLE_PLUGIN: &str = "example_plugin";
pub const LUMA_STATS_PLUGIN: &str = "luma_stats";

/// Register every built-in plugin with `registry`.
pub fn register_builtin(registry: &PluginRegistry) -> Result<(), RegistryError> {
    registry.register(EXAMPLE_PLUGIN, |_options: &Options| Ok(ExamplePlugin))?;
    registry.register(LUMA_STATS_PLUGIN, LumaStatsPlugin::from_options)?;
    Ok(())
}

/// Logs the frame and its parameters, returns a fixed sample of every
/// value kind.
pub struct ExamplePlugin;

impl FrameProcessorPlugin for ExamplePlugin {
    fn callback(&mut self, frame: &Frame, params: &Params) -> Result<Value, PluginError> {
        debug!(
            "{} x {} frame with format {}. Logging {} parameters:",
            frame.width()?,
            frame.height()?,
            frame.pixel_format()?,
            params.len()
        );
        for (key, value) in params {
            debug!("  -> {} = {:?}", key, value);
        }

        let mut map = BTreeMap::new();
        map.insert("example_str".to_string(), Value::from("Test"));
        map.insert("example_bool".to_string(), Value::from(true));
        map.insert("example_double".to_string(), Value::from(5.3));
        map.insert(
            "example_array".to_string(),
            Value::Array(vec![
                Value::from("Hello!"),
                Value::from(true),
                Value::from(17.38),
            ]),
        );
        Ok(Value::Map(map))
    }
}

/// Mean/min/max luma of a frame, optionally with a 256-bin histogram
/// returned as a shared buffer of little-endian `u32` counts.
///
/// Options: `sample_step` (every n-th pixel per axis, default 1).
/// Params: `histogram` (bool, default true).
pub struct LumaStatsPlugin {
    sample_step: usize,
}

impl LumaStatsPlugin {
    pub fn from_options(options: &Options) -> Result<Self, PluginError> {
        let sample_step = match options.get("sample_step") {
            None => 1,
            Some(value) => value
                .as_i64()
                .filter(|step| *step >= 1)
                .ok_or_else(|| {
                    PluginError::invalid_param("sample_step", "expected an integer >= 1")
                })? as usize,
        };
        Ok(Self { sample_step })
    }
}

fn luma_of(format: PixelFormat, px: &[u8]) -> u8 {
    match format {
        PixelFormat::Rgb | PixelFormat::Rgba => {
            let (r, g, b) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
            ((299 * r + 587 * g + 114 * b) / 1000) as u8
        }
        _ => px[0],
    }
}

impl FrameProcessorPlugin for LumaStatsPlugin {
    fn callback(&mut self, frame: &Frame, params: &Params) -> Result<Value, PluginError> {
        let format = frame.pixel_format()?;
        let bytes_per_pixel = match format {
            PixelFormat::Yuv420 => 1,
            PixelFormat::Yuv422 => 2,
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Jpeg | PixelFormat::Unknown => {
                return Err(PluginError::callback(format!(
                    "luma statistics are not supported for {format} frames"
                )))
            }
        };
        let include_histogram = match params.get("histogram") {
            None => true,
            Some(value) => value
                .as_bool()
                .ok_or_else(|| PluginError::invalid_param("histogram", "expected a bool"))?,
        };

        let width = frame.width()? as usize;
        let height = frame.height()? as usize;
        let view = frame.buffer_view(0)?;
        let stride = view.bytes_per_row();

        let mut histogram = [0u32; 256];
        let (mut sum, mut samples) = (0u64, 0u64);
        let (mut min, mut max) = (u8::MAX, u8::MIN);

        for y in (0..height).step_by(self.sample_step) {
            let Some(row) = view.get(y * stride..y * stride + width * bytes_per_pixel) else {
                break;
            };
            for px in row
                .chunks_exact(bytes_per_pixel)
                .step_by(self.sample_step)
            {
                let luma = luma_of(format, px);
                histogram[usize::from(luma)] += 1;
                sum += u64::from(luma);
                samples += 1;
                min = min.min(luma);
                max = max.max(luma);
            }
        }
        drop(view);

        if samples == 0 {
            return Err(PluginError::callback("frame contains no pixels"));
        }

        let mut result = BTreeMap::new();
        result.insert("mean".to_string(), Value::from(sum as f64 / samples as f64));
        result.insert("min".to_string(), Value::from(u32::from(min)));
        result.insert("max".to_string(), Value::from(u32::from(max)));
        result.insert("samples".to_string(), Value::Int(samples as i64));
        if include_histogram {
            let shared = SharedArray::build(histogram.len() * 4, |buf| {
                for (chunk, count) in buf.chunks_exact_mut(4).zip(histogram) {
                    chunk.copy_from_slice(&count.to_le_bytes());
                }
            });
            result.insert("histogram".to_string(), Value::from(shared));
        }
        Ok(Value::Map(result))
    }
}
