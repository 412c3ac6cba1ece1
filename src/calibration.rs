//! Calibration extraction from a live session.
//!
//! Intrinsics come from the profile negotiated at start. The depth→color
//! transform is queried from the driver through the session lock, so it never
//! overlaps a frame wait on the same pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::driver::{Extrinsics, Intrinsics, StreamKind};
use crate::error::{CalibrationError, FrameRetrievalError, NotFoundError};
use crate::registry::DeviceSessionRegistry;
use crate::session::DeviceSession;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeParams {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl From<Intrinsics> for PinholeParams {
    fn from(intrinsics: Intrinsics) -> Self {
        Self {
            fx: intrinsics.fx,
            fy: intrinsics.fy,
            cx: intrinsics.cx,
            cy: intrinsics.cy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub serial: String,
    /// Color stream resolution.
    pub width: u32,
    pub height: u32,
    pub color_intrinsics: PinholeParams,
    pub depth_intrinsics: PinholeParams,
    /// Depth to color, rotation column-major.
    pub extrinsics: Extrinsics,
}

impl CalibrationRecord {
    /// `<serial>_<width>x<height>.json`
    pub fn file_name(&self) -> String {
        format!("{}_{}x{}.json", self.serial, self.width, self.height)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct CalibrationExtractor {
    registry: Arc<DeviceSessionRegistry>,
}

impl CalibrationExtractor {
    pub fn new(registry: Arc<DeviceSessionRegistry>) -> Self {
        Self { registry }
    }

    /// Calibration of the active session for `serial`.
    pub fn extract(&self, serial: &str) -> Result<CalibrationRecord, CalibrationError> {
        let session = self
            .registry
            .get(serial)
            .ok_or_else(|| NotFoundError::new(serial))?;
        extract_session(&session)
    }
}

/// Read both intrinsics and the depth→color transform from `session`.
/// Requires color and depth video streams.
pub fn extract_session(session: &DeviceSession) -> Result<CalibrationRecord, CalibrationError> {
    let serial = session.serial();
    if !session.is_running() {
        return Err(CalibrationError::Inactive {
            serial: serial.to_string(),
        });
    }

    let color = video_intrinsics(session, StreamKind::Color)?;
    let depth = video_intrinsics(session, StreamKind::Depth)?;

    let extrinsics = session
        .with_pipeline(|pipeline| pipeline.extrinsics(StreamKind::Depth, StreamKind::Color))
        .map_err(|err| match err {
            FrameRetrievalError::Poisoned { serial } => CalibrationError::Poisoned { serial },
            _ => CalibrationError::Inactive {
                serial: serial.to_string(),
            },
        })?
        .map_err(|source| CalibrationError::Extrinsics {
            serial: serial.to_string(),
            source,
        })?;

    log::info!(
        "calibration read for device {} at {}x{}",
        serial,
        color.width,
        color.height
    );
    Ok(CalibrationRecord {
        serial: serial.to_string(),
        width: color.width,
        height: color.height,
        color_intrinsics: color.into(),
        depth_intrinsics: depth.into(),
        extrinsics,
    })
}

fn video_intrinsics(
    session: &DeviceSession,
    kind: StreamKind,
) -> Result<Intrinsics, CalibrationError> {
    let serial = session.serial().to_string();
    let stream = session
        .profile()
        .stream(kind)
        .ok_or_else(|| CalibrationError::MissingStream {
            serial: serial.clone(),
            kind,
        })?;
    let video = stream
        .video
        .as_ref()
        .ok_or_else(|| CalibrationError::NotVideoStream {
            serial: serial.clone(),
            kind,
        })?;
    video
        .intrinsics
        .ok_or(CalibrationError::NoIntrinsics { serial, kind })
}
