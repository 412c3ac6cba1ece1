use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{Driver, PixelFormat, StreamSpec, SyntheticDevice, SyntheticDriver};
use crate::feed::{FeedLayout, FeedSettings};
use crate::registry::SessionOptions;

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_IMAGE_WIDTH: u32 = 640;
const DEFAULT_IMAGE_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_COLOR_FORMAT: &str = "bgr8";
const DEFAULT_DEPTH_FORMAT: &str = "z16";
const DEFAULT_ALIGN_TO: &str = "color";
const DEFAULT_FALLBACK_INTERVAL_MS: u64 = 100;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_DRIVER: &str = "synthetic";
const DEFAULT_SYNTHETIC_SERIAL: &str = "SYN0001";
/// Larger than any depth camera mode; keeps buffer sizes in range.
const MAX_IMAGE_DIMENSION: u32 = 8192;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    image_width: Option<u32>,
    image_height: Option<u32>,
    fps: Option<u32>,
    data_dir: Option<PathBuf>,
    driver: Option<String>,
    emitter: Option<bool>,
    laser_power_mw: Option<f32>,
    preset_file: Option<PathBuf>,
    synthetic_serials: Option<Vec<String>>,
    streams: Option<StreamsConfigFile>,
    feed: Option<FeedConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamsConfigFile {
    color_format: Option<String>,
    depth_format: Option<String>,
    align_to: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FeedConfigFile {
    fallback_interval_ms: Option<u64>,
    layout: Option<String>,
    jpeg_quality: Option<u8>,
    fallback_color: Option<[u8; 3]>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverKind {
    Synthetic,
    V4l2,
}

impl std::str::FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" => Ok(DriverKind::Synthetic),
            "v4l2" => Ok(DriverKind::V4l2),
            other => Err(anyhow!("unknown driver {other:?} (expected synthetic or v4l2)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub image_width: u32,
    pub image_height: u32,
    pub fps: u32,
    pub data_dir: PathBuf,
    pub api_addr: String,
    pub driver: String,
    pub emitter: Option<bool>,
    pub laser_power_mw: Option<f32>,
    /// Vendor JSON settings preset loaded into every device on start.
    pub preset_file: Option<PathBuf>,
    pub synthetic_serials: Vec<String>,
    pub streams: StreamSettings,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub color_format: String,
    pub depth_format: String,
    /// `color` or `none`.
    pub align_to: String,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub fallback_interval: Duration,
    pub layout: String,
    pub jpeg_quality: u8,
    pub fallback_color: [u8; 3],
}

impl CaptureConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let streams = file.streams.unwrap_or_default();
        let feed = file.feed.unwrap_or_default();
        Self {
            image_width: file.image_width.unwrap_or(DEFAULT_IMAGE_WIDTH),
            image_height: file.image_height.unwrap_or(DEFAULT_IMAGE_HEIGHT),
            fps: file.fps.unwrap_or(DEFAULT_FPS),
            data_dir: file
                .data_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            driver: file.driver.unwrap_or_else(|| DEFAULT_DRIVER.to_string()),
            emitter: file.emitter,
            laser_power_mw: file.laser_power_mw,
            preset_file: file.preset_file,
            synthetic_serials: file
                .synthetic_serials
                .unwrap_or_else(|| vec![DEFAULT_SYNTHETIC_SERIAL.to_string()]),
            streams: StreamSettings {
                color_format: streams
                    .color_format
                    .unwrap_or_else(|| DEFAULT_COLOR_FORMAT.to_string()),
                depth_format: streams
                    .depth_format
                    .unwrap_or_else(|| DEFAULT_DEPTH_FORMAT.to_string()),
                align_to: streams
                    .align_to
                    .unwrap_or_else(|| DEFAULT_ALIGN_TO.to_string()),
            },
            feed: FeedConfig {
                fallback_interval: Duration::from_millis(
                    feed.fallback_interval_ms
                        .unwrap_or(DEFAULT_FALLBACK_INTERVAL_MS),
                ),
                layout: feed
                    .layout
                    .unwrap_or_else(|| FeedLayout::Color.as_str().to_string()),
                jpeg_quality: feed.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                fallback_color: feed.fallback_color.unwrap_or([0, 0, 0]),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAPTURE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("CAPTURE_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(driver) = std::env::var("CAPTURE_DRIVER") {
            if !driver.trim().is_empty() {
                self.driver = driver;
            }
        }
        if let Some(width) = parse_env::<u32>("CAPTURE_IMAGE_WIDTH")? {
            self.image_width = width;
        }
        if let Some(height) = parse_env::<u32>("CAPTURE_IMAGE_HEIGHT")? {
            self.image_height = height;
        }
        if let Some(fps) = parse_env::<u32>("CAPTURE_FPS")? {
            self.fps = fps;
        }
        if let Some(ms) = parse_env::<u64>("CAPTURE_FALLBACK_INTERVAL_MS")? {
            self.feed.fallback_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(anyhow!("image dimensions must be greater than zero"));
        }
        if self.image_width > MAX_IMAGE_DIMENSION || self.image_height > MAX_IMAGE_DIMENSION {
            return Err(anyhow!(
                "image dimensions must not exceed {MAX_IMAGE_DIMENSION}"
            ));
        }
        if let Some(power) = self.laser_power_mw {
            if !power.is_finite() || power < 0.0 {
                return Err(anyhow!("laser_power_mw must be a non-negative number"));
            }
        }
        if self.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if !(1..=100).contains(&self.feed.jpeg_quality) {
            return Err(anyhow!("feed.jpeg_quality must be within 1..=100"));
        }
        if self.feed.fallback_interval.is_zero() {
            return Err(anyhow!("feed.fallback_interval_ms must be greater than zero"));
        }
        self.driver_kind()?;
        self.feed_layout()?;
        self.color_format()?;
        if self.depth_format()? != PixelFormat::Z16 {
            return Err(anyhow!("streams.depth_format must be z16"));
        }
        self.alignment_enabled()?;
        if self.synthetic_serials.iter().any(|s| s.trim().is_empty()) {
            return Err(anyhow!("synthetic_serials must not contain empty entries"));
        }
        self.driver = self.driver.trim().to_ascii_lowercase();
        Ok(())
    }

    pub fn driver_kind(&self) -> Result<DriverKind> {
        self.driver.parse()
    }

    pub fn feed_layout(&self) -> Result<FeedLayout> {
        self.feed.layout.parse()
    }

    pub fn color_format(&self) -> Result<PixelFormat> {
        let format: PixelFormat = self.streams.color_format.parse()?;
        match format {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => Ok(format),
            other => Err(anyhow!("streams.color_format {other} is not a color format")),
        }
    }

    pub fn depth_format(&self) -> Result<PixelFormat> {
        self.streams.depth_format.parse()
    }

    pub fn alignment_enabled(&self) -> Result<bool> {
        match self.streams.align_to.trim().to_ascii_lowercase().as_str() {
            "color" => Ok(true),
            "none" | "" => Ok(false),
            other => Err(anyhow!("streams.align_to {other:?} must be color or none")),
        }
    }

    /// Color and depth at the configured resolution and rate.
    pub fn stream_specs(&self) -> Result<Vec<StreamSpec>> {
        Ok(vec![
            StreamSpec::color(
                self.image_width,
                self.image_height,
                self.color_format()?,
                self.fps,
            ),
            StreamSpec::depth(self.image_width, self.image_height, self.fps),
        ])
    }

    pub fn session_options(&self) -> Result<SessionOptions> {
        let mut options =
            SessionOptions::new(self.stream_specs()?).with_alignment(self.alignment_enabled()?);
        options.emitter = self.emitter;
        options.laser_power = self.laser_power_mw;
        if let Some(path) = &self.preset_file {
            let json = std::fs::read_to_string(path).map_err(|e| {
                anyhow!("failed to read preset file {}: {}", path.display(), e)
            })?;
            options.preset = Some(json);
        }
        Ok(options)
    }

    pub fn feed_settings(&self) -> Result<FeedSettings> {
        Ok(FeedSettings {
            interval: self.feed.fallback_interval,
            layout: self.feed_layout()?,
            jpeg_quality: self.feed.jpeg_quality,
            fallback_color: self.feed.fallback_color,
            width: self.image_width,
            height: self.image_height,
        })
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }

    pub fn calibrations_dir(&self) -> PathBuf {
        self.data_dir.join("calibrations")
    }

    /// Instantiate the configured hardware backend.
    pub fn build_driver(&self) -> Result<Arc<dyn Driver>> {
        match self.driver_kind()? {
            DriverKind::Synthetic => {
                let driver = SyntheticDriver::with_devices(
                    self.synthetic_serials
                        .iter()
                        .map(|serial| SyntheticDevice::new(serial, "D400")),
                );
                Ok(Arc::new(driver))
            }
            DriverKind::V4l2 => v4l2_driver(),
        }
    }
}

#[cfg(feature = "driver-v4l2")]
fn v4l2_driver() -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(crate::driver::V4l2Driver::new()))
}

#[cfg(not(feature = "driver-v4l2"))]
fn v4l2_driver() -> Result<Arc<dyn Driver>> {
    Err(anyhow!(
        "v4l2 driver requested but this build lacks the driver-v4l2 feature"
    ))
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{key} must be a non-negative integer")),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
