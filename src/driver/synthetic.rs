//! Synthetic depth camera rig.
//!
//! `SyntheticDriver` simulates any number of attached depth cameras entirely in
//! memory. It backs the test suite and the `synthetic` driver setting of the
//! binaries.
//!
//! Besides producing plausible frames (a color gradient with a moving band and
//! a tilted depth plane with sensor noise), the rig lets callers inject faults
//! per serial:
//! - refuse the next `open_pipeline`
//! - fail the next N frame waits
//! - drop one stream from the next N bundles
//! - fail `stop`
//! - slow every wait down
//!
//! The driver is a cheap handle over shared state: clone it, hand one clone to
//! the registry as `Arc<dyn Driver>` and keep the other to steer faults and
//! inspect live pipeline counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

use super::{
    DeviceInfo, Driver, DriverError, DriverErrorKind, Extrinsics, Frame, FrameBundle, Intrinsics,
    PipelineProfile, PixelFormat, StreamKind, StreamProfile, StreamSpec, VideoProfile,
};
use crate::frame::ImageBuffer;

const MAX_WIDTH: u32 = 1920;
const MAX_HEIGHT: u32 = 1080;
const SUPPORTED_FPS: [u32; 6] = [6, 15, 30, 60, 90, 200];
const DEPTH_SCALE: f32 = 0.001;
/// Nominal distance of the simulated wall, in depth units (millimeters).
const WALL_DEPTH_MM: u16 = 1200;

/// One simulated camera.
#[derive(Clone, Debug)]
pub struct SyntheticDevice {
    pub serial: String,
    pub name: String,
    pub product_line: String,
    /// Time each frame wait takes.
    pub frame_interval: Duration,
    /// Whether started profiles report factory intrinsics.
    pub reports_intrinsics: bool,
    pub supports_emitter: bool,
    pub has_imu: bool,
    pub depth_to_color: Extrinsics,
}

impl SyntheticDevice {
    pub fn new(serial: &str, product_line: &str) -> Self {
        Self {
            serial: serial.to_string(),
            name: format!("Synthetic {} Depth Camera", product_line),
            product_line: product_line.to_string(),
            frame_interval: Duration::ZERO,
            reports_intrinsics: true,
            supports_emitter: true,
            has_imu: false,
            depth_to_color: Extrinsics {
                rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
                translation: [0.015, 0.0, 0.0],
            },
        }
    }

    /// Placeholder entry the way some hosts list an integrated webcam.
    pub fn platform_camera() -> Self {
        let mut device = Self::new("platform-0", "Platform");
        device.name = "Platform Camera".to_string();
        device
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn without_intrinsics(mut self) -> Self {
        self.reports_intrinsics = false;
        self
    }

    pub fn without_emitter(mut self) -> Self {
        self.supports_emitter = false;
        self
    }

    pub fn with_imu(mut self) -> Self {
        self.has_imu = true;
        self
    }

    pub fn with_extrinsics(mut self, depth_to_color: Extrinsics) -> Self {
        self.depth_to_color = depth_to_color;
        self
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial.clone(),
            name: self.name.clone(),
            product_line: self.product_line.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    refuse_start: Option<DriverErrorKind>,
    failing_waits: u32,
    dropped: Option<(StreamKind, u32)>,
    fail_stop: bool,
    wait_delay: Duration,
}

#[derive(Debug, Default)]
struct RigState {
    devices: Vec<SyntheticDevice>,
    context_error: Option<String>,
    faults: HashMap<String, Faults>,
    live: HashMap<String, usize>,
    opened: HashMap<String, usize>,
    emitter: HashMap<String, bool>,
    laser_power: HashMap<String, f32>,
    presets: HashMap<String, String>,
}

/// In-memory driver. See the module docs.
#[derive(Clone, Debug, Default)]
pub struct SyntheticDriver {
    state: Arc<Mutex<RigState>>,
}

impl SyntheticDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = SyntheticDevice>) -> Self {
        let driver = Self::new();
        for device in devices {
            driver.attach(device);
        }
        driver
    }

    fn state(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug a device in. Replaces any device with the same serial.
    pub fn attach(&self, device: SyntheticDevice) {
        let mut state = self.state();
        state.devices.retain(|d| d.serial != device.serial);
        state.devices.push(device);
    }

    /// Unplug a device. Running pipelines start failing their waits.
    pub fn detach(&self, serial: &str) {
        self.state().devices.retain(|d| d.serial != serial);
    }

    /// Make `query_devices` fail until cleared with `None`.
    pub fn fail_context(&self, message: Option<&str>) {
        self.state().context_error = message.map(str::to_string);
    }

    /// Refuse the next `open_pipeline` for `serial` with the given kind.
    pub fn refuse_next_start(&self, serial: &str, kind: DriverErrorKind) {
        self.state().faults.entry(serial.to_string()).or_default().refuse_start = Some(kind);
    }

    pub fn fail_next_waits(&self, serial: &str, count: u32) {
        self.state().faults.entry(serial.to_string()).or_default().failing_waits = count;
    }

    /// Omit `kind` from the next `count` bundles of `serial`.
    pub fn drop_stream(&self, serial: &str, kind: StreamKind, count: u32) {
        self.state().faults.entry(serial.to_string()).or_default().dropped = Some((kind, count));
    }

    pub fn fail_stop(&self, serial: &str, fail: bool) {
        self.state().faults.entry(serial.to_string()).or_default().fail_stop = fail;
    }

    pub fn set_wait_delay(&self, serial: &str, delay: Duration) {
        self.state().faults.entry(serial.to_string()).or_default().wait_delay = delay;
    }

    /// Pipelines for `serial` that currently hold hardware.
    pub fn live_pipelines(&self, serial: &str) -> usize {
        self.state().live.get(serial).copied().unwrap_or(0)
    }

    /// Pipelines ever opened for `serial`.
    pub fn pipelines_opened(&self, serial: &str) -> usize {
        self.state().opened.get(serial).copied().unwrap_or(0)
    }

    pub fn emitter_enabled(&self, serial: &str) -> Option<bool> {
        self.state().emitter.get(serial).copied()
    }

    pub fn laser_power(&self, serial: &str) -> Option<f32> {
        self.state().laser_power.get(serial).copied()
    }

    /// Last settings preset loaded into `serial`.
    pub fn preset(&self, serial: &str) -> Option<String> {
        self.state().presets.get(serial).cloned()
    }
}

impl Driver for SyntheticDriver {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn query_devices(&self) -> Result<Vec<DeviceInfo>, DriverError> {
        let state = self.state();
        if let Some(message) = &state.context_error {
            return Err(DriverError::new(DriverErrorKind::Context, message.clone()));
        }
        Ok(state.devices.iter().map(SyntheticDevice::info).collect())
    }

    fn open_pipeline(
        &self,
        serial: &str,
        streams: &[StreamSpec],
    ) -> Result<Box<dyn super::Pipeline>, DriverError> {
        let mut state = self.state();
        let device = state
            .devices
            .iter()
            .find(|d| d.serial == serial)
            .cloned()
            .ok_or_else(|| {
                DriverError::new(
                    DriverErrorKind::NotFound,
                    format!("no device with serial {}", serial),
                )
            })?;
        if let Some(kind) = state
            .faults
            .get_mut(serial)
            .and_then(|faults| faults.refuse_start.take())
        {
            return Err(DriverError::new(kind, "couldn't resolve requests"));
        }

        let profile = build_profile(&device, streams)?;
        *state.live.entry(serial.to_string()).or_default() += 1;
        *state.opened.entry(serial.to_string()).or_default() += 1;
        drop(state);

        log::debug!(
            "synthetic: started pipeline for {} ({} streams)",
            serial,
            profile.streams.len()
        );
        Ok(Box::new(SyntheticPipeline {
            state: Arc::clone(&self.state),
            device,
            profile,
            frame_number: 0,
            started_at: Instant::now(),
            running: true,
        }))
    }
}

fn build_profile(
    device: &SyntheticDevice,
    streams: &[StreamSpec],
) -> Result<PipelineProfile, DriverError> {
    let unsupported = |message: String| DriverError::new(DriverErrorKind::Unsupported, message);
    if streams.is_empty() {
        return Err(unsupported("no streams requested".to_string()));
    }

    let mut profiles: Vec<StreamProfile> = Vec::with_capacity(streams.len());
    for spec in streams {
        if profiles.iter().any(|p| p.kind == spec.kind) {
            return Err(unsupported(format!("{} requested twice", spec.kind)));
        }
        if !SUPPORTED_FPS.contains(&spec.fps) {
            return Err(unsupported(format!("{} fps not offered", spec.fps)));
        }
        let format_ok = match spec.kind {
            StreamKind::Color => matches!(spec.format, PixelFormat::Bgr8 | PixelFormat::Rgb8),
            StreamKind::Depth => spec.format == PixelFormat::Z16,
            StreamKind::Infrared(index) => {
                (1..=2).contains(&index)
                    && matches!(spec.format, PixelFormat::Y8 | PixelFormat::Y16)
            }
            StreamKind::Gyro | StreamKind::Accel => {
                device.has_imu && spec.format == PixelFormat::Xyz32f
            }
        };
        if !format_ok {
            return Err(unsupported(format!(
                "{} stream does not offer {}",
                spec.kind, spec.format
            )));
        }

        let video = if spec.kind.is_video() {
            if spec.width == 0
                || spec.height == 0
                || spec.width > MAX_WIDTH
                || spec.height > MAX_HEIGHT
            {
                return Err(unsupported(format!(
                    "{} resolution {}x{} not offered",
                    spec.kind, spec.width, spec.height
                )));
            }
            let intrinsics = device.reports_intrinsics.then(|| Intrinsics {
                width: spec.width,
                height: spec.height,
                fx: spec.width as f32 * 0.95,
                fy: spec.width as f32 * 0.95,
                cx: spec.width as f32 / 2.0,
                cy: spec.height as f32 / 2.0,
            });
            Some(VideoProfile {
                width: spec.width,
                height: spec.height,
                intrinsics,
            })
        } else {
            None
        };

        profiles.push(StreamProfile {
            kind: spec.kind,
            format: spec.format,
            fps: spec.fps,
            video,
        });
    }

    Ok(PipelineProfile {
        serial: device.serial.clone(),
        streams: profiles,
        depth_scale: DEPTH_SCALE,
    })
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

struct SyntheticPipeline {
    state: Arc<Mutex<RigState>>,
    device: SyntheticDevice,
    profile: PipelineProfile,
    frame_number: u64,
    started_at: Instant,
    running: bool,
}

impl SyntheticPipeline {
    fn state(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let serial = self.device.serial.clone();
        let mut state = self.state();
        if let Some(count) = state.live.get_mut(&serial) {
            *count = count.saturating_sub(1);
        }
    }

    fn render(&self, stream: &StreamProfile) -> ImageBuffer {
        let (width, height) = stream
            .video
            .map(|video| (video.width, video.height))
            .unwrap_or((1, 1));
        let n = self.frame_number;
        match stream.kind {
            StreamKind::Color => {
                let band = (n * 4 % width.max(1) as u64) as u32;
                let mut data = Vec::with_capacity(width as usize * height as usize * 3);
                for y in 0..height {
                    for x in 0..width {
                        let in_band = x.abs_diff(band) < 4;
                        let r = (x * 255 / width.max(1)) as u8;
                        let g = (y * 255 / height.max(1)) as u8;
                        let b = if in_band { 255 } else { (n % 256) as u8 };
                        let px = match stream.format {
                            PixelFormat::Bgr8 => [b, g, r],
                            _ => [r, g, b],
                        };
                        data.extend_from_slice(&px);
                    }
                }
                ImageBuffer::new(width, height, stream.format, data)
            }
            StreamKind::Depth => {
                let mut rng = rand::thread_rng();
                let band = (n * 2 % height.max(1) as u64) as u32;
                let depth: Vec<u16> = (0..height)
                    .flat_map(|y| (0..width).map(move |x| (x, y)))
                    .map(|(x, y)| {
                        if y.abs_diff(band) < 2 {
                            // Object in front of the wall.
                            return WALL_DEPTH_MM / 2;
                        }
                        let tilt = (x * 200 / width.max(1)) as u16;
                        let noise: i32 = rng.gen_range(-2..=2);
                        (WALL_DEPTH_MM as i32 + tilt as i32 + noise).max(1) as u16
                    })
                    .collect();
                ImageBuffer::from_depth(width, height, &depth)
            }
            StreamKind::Infrared(index) => {
                let bpp = stream.format.bytes_per_pixel();
                let data = (0..width as usize * height as usize * bpp)
                    .map(|i| ((i as u64 + n + index as u64 * 17) % 256) as u8)
                    .collect();
                ImageBuffer::new(width, height, stream.format, data)
            }
            StreamKind::Gyro | StreamKind::Accel => {
                let sample: [f32; 3] = if stream.kind == StreamKind::Accel {
                    [0.0, -9.81, 0.0]
                } else {
                    [0.0; 3]
                };
                let data = sample.iter().flat_map(|v| v.to_le_bytes()).collect();
                ImageBuffer::new(1, 1, PixelFormat::Xyz32f, data)
            }
        }
    }
}

impl super::Pipeline for SyntheticPipeline {
    fn profile(&self) -> &PipelineProfile {
        &self.profile
    }

    fn wait_for_frames(&mut self) -> Result<FrameBundle, DriverError> {
        if !self.running {
            return Err(DriverError::new(
                DriverErrorKind::Stopped,
                "pipeline is not started",
            ));
        }

        let serial = self.device.serial.clone();
        let (attached, fail, dropped, delay) = {
            let mut state = self.state();
            let attached = state.devices.iter().any(|d| d.serial == serial);
            let faults = state.faults.entry(serial.clone()).or_default();
            let fail = if faults.failing_waits > 0 {
                faults.failing_waits -= 1;
                true
            } else {
                false
            };
            // Only a wait that delivers a bundle uses up a dropped stream.
            let dropped = match faults.dropped.as_mut() {
                _ if fail || !attached => None,
                Some((kind, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*kind)
                }
                _ => None,
            };
            (attached, fail, dropped, faults.wait_delay)
        };

        // Blocking part of the wait; no rig lock held.
        let pause = self.device.frame_interval + delay;
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }

        if !attached {
            return Err(DriverError::new(
                DriverErrorKind::Hardware,
                format!("device {} disconnected", serial),
            ));
        }
        if fail {
            return Err(DriverError::new(
                DriverErrorKind::Timeout,
                "frame didn't arrive within 5000",
            ));
        }

        self.frame_number += 1;
        let timestamp_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
        let frames = self
            .profile
            .streams
            .iter()
            .filter(|stream| Some(stream.kind) != dropped)
            .map(|stream| Frame {
                kind: stream.kind,
                image: self.render(stream),
                timestamp_ms,
                frame_number: self.frame_number,
            })
            .collect();
        Ok(FrameBundle { frames })
    }

    fn extrinsics(&self, from: StreamKind, to: StreamKind) -> Result<Extrinsics, DriverError> {
        for kind in [from, to] {
            if self.profile.stream(kind).is_none() {
                return Err(DriverError::new(
                    DriverErrorKind::NotFound,
                    format!("{} stream is not enabled", kind),
                ));
            }
        }
        // Depth and both IR imagers share the depth origin.
        let on_depth_origin = |kind: StreamKind| {
            matches!(kind, StreamKind::Depth | StreamKind::Infrared(_))
        };
        match (from, to) {
            (a, b) if a == b => Ok(Extrinsics::identity()),
            (a, StreamKind::Color) if on_depth_origin(a) => Ok(self.device.depth_to_color),
            (StreamKind::Color, b) if on_depth_origin(b) => Ok(self.device.depth_to_color.inverse()),
            (a, b) if on_depth_origin(a) && on_depth_origin(b) => Ok(Extrinsics::identity()),
            (a, b) => Err(DriverError::new(
                DriverErrorKind::Unsupported,
                format!("no calibration between {} and {}", a, b),
            )),
        }
    }

    fn set_emitter(&mut self, enabled: bool) -> Result<bool, DriverError> {
        if !self.device.supports_emitter {
            return Ok(false);
        }
        let serial = self.device.serial.clone();
        self.state().emitter.insert(serial, enabled);
        Ok(true)
    }

    fn set_laser_power(&mut self, milliwatts: f32) -> Result<bool, DriverError> {
        if !self.device.supports_emitter {
            return Ok(false);
        }
        if !milliwatts.is_finite() || milliwatts < 0.0 {
            return Err(DriverError::new(
                DriverErrorKind::Unsupported,
                format!("laser power {} mW out of range", milliwatts),
            ));
        }
        let serial = self.device.serial.clone();
        self.state().laser_power.insert(serial, milliwatts);
        Ok(true)
    }

    fn load_preset(&mut self, json: &str) -> Result<bool, DriverError> {
        if let Err(err) = serde_json::from_str::<serde_json::Value>(json) {
            return Err(DriverError::new(
                DriverErrorKind::Unsupported,
                format!("settings preset is not valid JSON: {}", err),
            ));
        }
        let serial = self.device.serial.clone();
        self.state().presets.insert(serial, json.to_string());
        Ok(true)
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        if !self.running {
            return Err(DriverError::new(
                DriverErrorKind::Stopped,
                "pipeline already stopped",
            ));
        }
        let fail = self
            .state()
            .faults
            .get(&self.device.serial)
            .map(|faults| faults.fail_stop)
            .unwrap_or(false);
        // Hardware is released even when the stop call reports a fault.
        self.release();
        if fail {
            return Err(DriverError::new(
                DriverErrorKind::Hardware,
                "usb control transfer failed during stop",
            ));
        }
        log::debug!("synthetic: stopped pipeline for {}", self.device.serial);
        Ok(())
    }
}

impl Drop for SyntheticPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
