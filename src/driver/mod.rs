//! Hardware driver seam.
//!
//! The capture kernel never talks to a camera SDK directly. Everything it needs
//! from hardware goes through two object-safe traits:
//!
//! - `Driver`: the device context (enumerate attached devices, open pipelines)
//! - `Pipeline`: one started capture pipeline bound to a single serial
//!
//! Backends:
//! - `synthetic`: in-memory depth camera rig with fault injection (always built)
//! - `v4l2`: paired color/depth V4L2 nodes (feature: driver-v4l2)
//!
//! Pipelines are NOT safe for concurrent use. `DeviceSession` wraps each one in
//! its own mutex; nothing else in the crate holds a `Pipeline`.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

pub use crate::error::{DriverError, DriverErrorKind};
use crate::frame::ImageBuffer;

pub mod synthetic;
#[cfg(feature = "driver-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticDevice, SyntheticDriver};
#[cfg(feature = "driver-v4l2")]
pub use v4l2::V4l2Driver;

// ----------------------------------------------------------------------------
// Stream description
// ----------------------------------------------------------------------------

/// Kind of sensor stream. Infrared carries its sensor index so that devices
/// with two IR imagers can deliver both in one frameset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Color,
    Depth,
    Infrared(u8),
    Gyro,
    Accel,
}

impl StreamKind {
    pub fn is_video(self) -> bool {
        matches!(
            self,
            StreamKind::Color | StreamKind::Depth | StreamKind::Infrared(_)
        )
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Color => f.write_str("color"),
            StreamKind::Depth => f.write_str("depth"),
            StreamKind::Infrared(index) => write!(f, "infrared[{index}]"),
            StreamKind::Gyro => f.write_str("gyro"),
            StreamKind::Accel => f.write_str("accel"),
        }
    }
}

/// Pixel layout of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Z16,
    Y8,
    Y16,
    /// Three little-endian f32 per sample (motion streams).
    Xyz32f,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Z16 | PixelFormat::Y16 => 2,
            PixelFormat::Y8 => 1,
            PixelFormat::Xyz32f => 12,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Z16 => "z16",
            PixelFormat::Y8 => "y8",
            PixelFormat::Y16 => "y16",
            PixelFormat::Xyz32f => "xyz32f",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bgr8" => Ok(PixelFormat::Bgr8),
            "rgb8" => Ok(PixelFormat::Rgb8),
            "z16" => Ok(PixelFormat::Z16),
            "y8" => Ok(PixelFormat::Y8),
            "y16" => Ok(PixelFormat::Y16),
            "xyz32f" => Ok(PixelFormat::Xyz32f),
            other => Err(anyhow!("unknown pixel format '{}'", other)),
        }
    }
}

/// Requested stream configuration. Immutable for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
}

impl StreamSpec {
    pub fn color(width: u32, height: u32, format: PixelFormat, fps: u32) -> Self {
        Self {
            kind: StreamKind::Color,
            width,
            height,
            format,
            fps,
        }
    }

    pub fn depth(width: u32, height: u32, fps: u32) -> Self {
        Self {
            kind: StreamKind::Depth,
            width,
            height,
            format: PixelFormat::Z16,
            fps,
        }
    }

    pub fn infrared(index: u8, width: u32, height: u32, fps: u32) -> Self {
        Self {
            kind: StreamKind::Infrared(index),
            width,
            height,
            format: PixelFormat::Y8,
            fps,
        }
    }
}

// ----------------------------------------------------------------------------
// Live profile
// ----------------------------------------------------------------------------

/// Pinhole projection parameters of one video stream.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

/// Rigid transform between two sensors. `rotation` is a column-major 3x3
/// matrix; `translation` is in meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extrinsics {
    pub rotation: [f32; 9],
    pub translation: [f32; 3],
}

impl Extrinsics {
    pub fn identity() -> Self {
        Self {
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            translation: [0.0; 3],
        }
    }

    /// Transform mapping the target frame back to the source frame.
    pub fn inverse(&self) -> Self {
        let r = &self.rotation;
        // Transpose of a column-major matrix.
        let rotation = [r[0], r[3], r[6], r[1], r[4], r[7], r[2], r[5], r[8]];
        let t = &self.translation;
        let translation = [
            -(rotation[0] * t[0] + rotation[3] * t[1] + rotation[6] * t[2]),
            -(rotation[1] * t[0] + rotation[4] * t[1] + rotation[7] * t[2]),
            -(rotation[2] * t[0] + rotation[5] * t[1] + rotation[8] * t[2]),
        ];
        Self {
            rotation,
            translation,
        }
    }

    pub fn transform(&self, point: [f32; 3]) -> [f32; 3] {
        let r = &self.rotation;
        let t = &self.translation;
        let [x, y, z] = point;
        [
            r[0] * x + r[3] * y + r[6] * z + t[0],
            r[1] * x + r[4] * y + r[7] * z + t[1],
            r[2] * x + r[5] * y + r[8] * z + t[2],
        ]
    }
}

/// Video-specific part of a stream profile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    /// `None` when the backend cannot report factory calibration.
    pub intrinsics: Option<Intrinsics>,
}

/// One stream as actually negotiated by the hardware.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamProfile {
    pub kind: StreamKind,
    pub format: PixelFormat,
    pub fps: u32,
    /// `None` for motion streams.
    pub video: Option<VideoProfile>,
}

/// Active stream set of a started pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineProfile {
    pub serial: String,
    pub streams: Vec<StreamProfile>,
    /// Meters per depth unit.
    pub depth_scale: f32,
}

impl PipelineProfile {
    pub fn stream(&self, kind: StreamKind) -> Option<&StreamProfile> {
        self.streams.iter().find(|stream| stream.kind == kind)
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        let mut kinds: Vec<StreamKind> = self.streams.iter().map(|s| s.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn intrinsics(&self, kind: StreamKind) -> Option<Intrinsics> {
        self.stream(kind)
            .and_then(|stream| stream.video)
            .and_then(|video| video.intrinsics)
    }
}

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Device-level information reported by the driver context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub name: String,
    pub product_line: String,
}

/// One decoded frame from one stream.
#[derive(Debug)]
pub struct Frame {
    pub kind: StreamKind,
    pub image: ImageBuffer,
    /// Driver timestamp in milliseconds.
    pub timestamp_ms: f64,
    pub frame_number: u64,
}

/// Frames returned by a single `wait_for_frames` call. May be partial.
#[derive(Debug, Default)]
pub struct FrameBundle {
    pub frames: Vec<Frame>,
}

impl FrameBundle {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, kind: StreamKind) -> bool {
        self.frames.iter().any(|frame| frame.kind == kind)
    }

    pub fn get(&self, kind: StreamKind) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.kind == kind)
    }

    /// Latest driver timestamp among the bundle's frames.
    pub fn timestamp_ms(&self) -> f64 {
        self.frames
            .iter()
            .map(|frame| frame.timestamp_ms)
            .fold(0.0, f64::max)
    }
}

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// Device context: the entry point to a camera SDK.
pub trait Driver: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Query every attached device, pseudo-devices included.
    fn query_devices(&self) -> Result<Vec<DeviceInfo>, DriverError>;

    /// Build a pipeline bound to `serial`, enable `streams` and start capture.
    ///
    /// On error no hardware resources remain held.
    fn open_pipeline(
        &self,
        serial: &str,
        streams: &[StreamSpec],
    ) -> Result<Box<dyn Pipeline>, DriverError>;
}

/// A started capture pipeline.
pub trait Pipeline: Send {
    fn profile(&self) -> &PipelineProfile;

    /// Block until the next frame bundle arrives or the driver times out.
    fn wait_for_frames(&mut self) -> Result<FrameBundle, DriverError>;

    /// Stream-to-stream rigid transform from the driver's calibration tables.
    fn extrinsics(&self, from: StreamKind, to: StreamKind) -> Result<Extrinsics, DriverError>;

    /// Toggle the depth projector. Returns `false` when the option is not
    /// supported by the device.
    fn set_emitter(&mut self, enabled: bool) -> Result<bool, DriverError>;

    /// Projector power in milliwatts. Returns `false` when the device has no
    /// adjustable projector.
    fn set_laser_power(&mut self, _milliwatts: f32) -> Result<bool, DriverError> {
        Ok(false)
    }

    /// Load a vendor JSON settings preset (visual preset, depth units,
    /// exposure tables). Returns `false` when the device has no advanced
    /// mode to load it into.
    fn load_preset(&mut self, _json: &str) -> Result<bool, DriverError> {
        Ok(false)
    }

    /// Stop capture and release the hardware.
    fn stop(&mut self) -> Result<(), DriverError>;
}
