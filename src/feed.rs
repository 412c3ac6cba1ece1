//! Continuous per-device frame feed with fallback.
//!
//! A `FrameFeed` is an infinite iterator of multipart chunks for one serial.
//! Every tick it looks the serial up in the registry again, so a session
//! started or stopped elsewhere is picked up on the next tick. Hardware
//! errors and incomplete framesets become a fallback chunk for that tick; the
//! feed itself never fails. The consumer cancels by dropping the iterator.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::driver::StreamKind;
use crate::error::{EncodeError, FrameRetrievalError};
use crate::frame::{hstack, FrameSet, ImageBuffer};
use crate::registry::DeviceSessionRegistry;

pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Frame one JPEG as a multipart part.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(jpeg.len() + 48);
    chunk.extend_from_slice(b"--");
    chunk.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
    chunk.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n\r\n");
    chunk
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedLayout {
    /// Color image only.
    #[default]
    Color,
    /// Color on the left, colorized depth on the right.
    ColorDepth,
}

impl FeedLayout {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedLayout::Color => "color",
            FeedLayout::ColorDepth => "color_depth",
        }
    }

    fn required_kinds(self) -> &'static [StreamKind] {
        match self {
            FeedLayout::Color => &[StreamKind::Color],
            FeedLayout::ColorDepth => &[StreamKind::Color, StreamKind::Depth],
        }
    }
}

impl FromStr for FeedLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "color" => Ok(FeedLayout::Color),
            "color_depth" => Ok(FeedLayout::ColorDepth),
            other => Err(anyhow!("unknown feed layout {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedSettings {
    /// Minimum spacing between two ticks.
    pub interval: Duration,
    pub layout: FeedLayout,
    pub jpeg_quality: u8,
    pub fallback_color: [u8; 3],
    /// Dimensions of one fallback pane. The color+depth layout doubles the width.
    pub width: u32,
    pub height: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            layout: FeedLayout::Color,
            jpeg_quality: 80,
            fallback_color: [0, 0, 0],
            width: 640,
            height: 480,
        }
    }
}

/// Why a tick produced the placeholder.
#[derive(Debug)]
pub enum FallbackReason {
    Inactive,
    Frame(FrameRetrievalError),
    Encode(EncodeError),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Inactive => f.write_str("device not streaming"),
            FallbackReason::Frame(err) => write!(f, "{err}"),
            FallbackReason::Encode(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug)]
pub enum FeedTick {
    Live(Vec<u8>),
    Fallback { chunk: Vec<u8>, reason: FallbackReason },
}

impl FeedTick {
    pub fn is_live(&self) -> bool {
        matches!(self, FeedTick::Live(_))
    }

    pub fn chunk(&self) -> &[u8] {
        match self {
            FeedTick::Live(chunk) | FeedTick::Fallback { chunk, .. } => chunk,
        }
    }

    pub fn into_chunk(self) -> Vec<u8> {
        match self {
            FeedTick::Live(chunk) | FeedTick::Fallback { chunk, .. } => chunk,
        }
    }
}

pub struct FrameFeedGenerator {
    registry: Arc<DeviceSessionRegistry>,
    settings: FeedSettings,
    fallback: Arc<[u8]>,
}

impl FrameFeedGenerator {
    /// Encodes the fallback placeholder once up front.
    pub fn new(
        registry: Arc<DeviceSessionRegistry>,
        settings: FeedSettings,
    ) -> Result<Self, EncodeError> {
        let width = match settings.layout {
            FeedLayout::Color => u64::from(settings.width),
            FeedLayout::ColorDepth => u64::from(settings.width) * 2,
        };
        let height = u64::from(settings.height);
        // JPEG caps both sides at 65535.
        if width > u64::from(u16::MAX) || height > u64::from(u16::MAX) {
            return Err(EncodeError::Dimensions { width, height });
        }
        let width = width as u32;
        let placeholder = ImageBuffer::solid(width, settings.height, settings.fallback_color)
            .encode_jpeg(settings.jpeg_quality)?;
        Ok(Self {
            registry,
            settings,
            fallback: multipart_chunk(&placeholder).into(),
        })
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    /// The multipart chunk substituted when no live frame is available.
    pub fn fallback_chunk(&self) -> &[u8] {
        &self.fallback
    }

    /// A fresh feed for `serial`. Each call is independent.
    pub fn stream(&self, serial: &str) -> FrameFeed {
        FrameFeed {
            registry: Arc::clone(&self.registry),
            serial: serial.to_string(),
            settings: self.settings.clone(),
            fallback: Arc::clone(&self.fallback),
            last_tick: None,
            ticks: 0,
            fallbacks: 0,
        }
    }
}

pub struct FrameFeed {
    registry: Arc<DeviceSessionRegistry>,
    serial: String,
    settings: FeedSettings,
    fallback: Arc<[u8]>,
    last_tick: Option<Instant>,
    ticks: u64,
    fallbacks: u64,
}

impl FrameFeed {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    /// Produce the next chunk. Blocks until at least one interval has passed
    /// since the previous tick, then for at most one hardware wait.
    pub fn tick(&mut self) -> FeedTick {
        self.pace();
        self.ticks += 1;

        let Some(session) = self.registry.get(&self.serial) else {
            log::debug!(
                "no active stream for device {}, yielding fallback",
                self.serial
            );
            return self.fallback(FallbackReason::Inactive);
        };

        let rendered = session
            .capture(self.settings.layout.required_kinds())
            .map_err(|err| match err {
                FrameRetrievalError::Inactive { .. } => FallbackReason::Inactive,
                other => FallbackReason::Frame(other),
            })
            .and_then(|frames| self.render(frames));

        match rendered {
            Ok(jpeg) => FeedTick::Live(multipart_chunk(&jpeg)),
            Err(FallbackReason::Inactive) => self.fallback(FallbackReason::Inactive),
            Err(reason) => {
                log::warn!(
                    "frame retrieval for device {} failed, yielding fallback: {}",
                    self.serial,
                    reason
                );
                self.fallback(reason)
            }
        }
    }

    fn render(&self, mut frames: FrameSet) -> Result<Vec<u8>, FallbackReason> {
        let quality = self.settings.jpeg_quality;
        let Some(color) = frames.take(StreamKind::Color) else {
            return Err(FallbackReason::Frame(FrameRetrievalError::Incomplete {
                serial: self.serial.clone(),
                missing: vec![StreamKind::Color],
            }));
        };
        let encoded = match (self.settings.layout, frames.depth()) {
            (FeedLayout::ColorDepth, Some(depth)) => {
                hstack(&color, depth).and_then(|pair| pair.encode_jpeg(quality))
            }
            _ => color.encode_jpeg(quality),
        };
        encoded.map_err(FallbackReason::Encode)
    }

    fn fallback(&mut self, reason: FallbackReason) -> FeedTick {
        self.fallbacks += 1;
        FeedTick::Fallback {
            chunk: self.fallback.to_vec(),
            reason,
        }
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();
            if elapsed < self.settings.interval {
                thread::sleep(self.settings.interval - elapsed);
            }
        }
        self.last_tick = Some(Instant::now());
    }
}

impl Iterator for FrameFeed {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.tick().into_chunk())
    }
}
