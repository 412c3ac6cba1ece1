//! Single-shot color+depth capture.

use chrono::Local;

use crate::driver::StreamKind;
use crate::error::{CaptureError, EncodeError, FrameRetrievalError, NotFoundError};
use crate::frame::ImageBuffer;
use crate::registry::DeviceSessionRegistry;

pub const CAPTURE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One color+depth pair. Depth is on the color grid when the session aligns.
#[derive(Clone, Debug)]
pub struct Capture {
    pub serial: String,
    /// Local time, `%Y%m%d_%H%M%S`.
    pub timestamp: String,
    pub color: ImageBuffer,
    pub depth: ImageBuffer,
}

impl Capture {
    pub fn color_jpeg(&self, quality: u8) -> Result<Vec<u8>, EncodeError> {
        self.color.encode_jpeg(quality)
    }

    /// Raw depth units as a 16-bit grayscale PNG.
    pub fn depth_png(&self) -> Result<Vec<u8>, EncodeError> {
        self.depth.encode_png()
    }

    /// `(color_<serial>_<ts>.jpg, depth_<serial>_<ts>.png)`
    pub fn file_names(&self) -> (String, String) {
        (
            format!("color_{}_{}.jpg", self.serial, self.timestamp),
            format!("depth_{}_{}.png", self.serial, self.timestamp),
        )
    }
}

/// Take the next color+depth frameset from an active device.
///
/// Competes with any streaming feed on the same device for the session lock;
/// whichever gets it first consumes the next hardware frame.
pub fn capture_once(registry: &DeviceSessionRegistry, serial: &str) -> Result<Capture, CaptureError> {
    let session = registry.get(serial).ok_or_else(|| {
        log::warn!(
            "attempted capture while streaming is inactive for device {}",
            serial
        );
        NotFoundError::new(serial)
    })?;

    let mut frames = session.capture(&[StreamKind::Color, StreamKind::Depth])?;
    let timestamp = Local::now().format(CAPTURE_TIMESTAMP_FORMAT).to_string();
    let (Some(color), Some(depth)) = (frames.take(StreamKind::Color), frames.take(StreamKind::Depth))
    else {
        return Err(FrameRetrievalError::Incomplete {
            serial: serial.to_string(),
            missing: frames.missing(&[StreamKind::Color, StreamKind::Depth]),
        }
        .into());
    };

    log::info!("captured color+depth from device {} at {}", serial, timestamp);
    Ok(Capture {
        serial: serial.to_string(),
        timestamp,
        color,
        depth,
    })
}
