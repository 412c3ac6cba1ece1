//! Error taxonomy for the capture kernel.
//!
//! Every public operation that touches hardware returns one of these types.
//! Streaming paths swallow `FrameRetrievalError` into a fallback frame; every
//! one-shot path (start, stop, capture, calibration, synchronized rounds)
//! hands the error back to the caller untouched.

use std::time::Duration;

use thiserror::Error;

use crate::driver::StreamKind;

/// Classification of a driver failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The driver context itself could not be queried.
    Context,
    /// No attached device carries the requested serial.
    NotFound,
    /// The requested stream configuration is not offered by the device.
    Unsupported,
    /// The device is held by another process or out of USB bandwidth.
    Busy,
    /// The process lacks permission to open the device.
    Permission,
    /// A frame did not arrive before the driver deadline.
    Timeout,
    /// Any other hardware fault reported by the driver.
    Hardware,
    /// The pipeline has already been stopped.
    Stopped,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DriverErrorKind::Context => "context",
            DriverErrorKind::NotFound => "not found",
            DriverErrorKind::Unsupported => "unsupported",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::Permission => "permission denied",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Raw failure reported by a [`crate::driver::Driver`] or [`crate::driver::Pipeline`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The driver context could not be queried. Fatal to enumeration.
#[derive(Debug, Error)]
#[error("hardware context unavailable: {0}")]
pub struct HardwareContextError(#[source] pub DriverError);

/// A device could not be brought into a streaming session.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("device {serial} is not attached")]
    UnknownDevice { serial: String },
    #[error("device {serial} does not support the requested streams: {source}")]
    Unsupported {
        serial: String,
        #[source]
        source: DriverError,
    },
    #[error("device {serial} refused to start: {source}")]
    Refused {
        serial: String,
        #[source]
        source: DriverError,
    },
    #[error("device {serial} cannot align depth to color: {reason}")]
    Alignment { serial: String, reason: String },
    #[error(transparent)]
    Context(#[from] HardwareContextError),
}

impl StartError {
    pub(crate) fn from_driver(serial: &str, source: DriverError) -> Self {
        let serial = serial.to_string();
        match source.kind {
            DriverErrorKind::NotFound => StartError::UnknownDevice { serial },
            DriverErrorKind::Unsupported => StartError::Unsupported { serial, source },
            _ => StartError::Refused { serial, source },
        }
    }
}

/// No active session exists for the serial.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no active session for device {serial}")]
pub struct NotFoundError {
    pub serial: String,
}

impl NotFoundError {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
        }
    }
}

/// The hardware stop call failed. Reported, never raised: the session is
/// removed regardless.
#[derive(Clone, Debug, Error)]
#[error("device {serial} did not stop cleanly: {source}")]
pub struct StopError {
    pub serial: String,
    #[source]
    pub source: DriverError,
}

/// A frame could not be read from a live session.
#[derive(Debug, Error)]
pub enum FrameRetrievalError {
    #[error("device {serial} is not streaming")]
    Inactive { serial: String },
    #[error("device {serial} frame wait failed: {source}")]
    Hardware {
        serial: String,
        #[source]
        source: DriverError,
    },
    #[error("device {serial} delivered an incomplete frameset (missing {missing:?})")]
    Incomplete {
        serial: String,
        missing: Vec<StreamKind>,
    },
    #[error("device {serial} pipeline lock poisoned")]
    Poisoned { serial: String },
}

/// Calibration could not be read from a session's live profile.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("device {serial} is not streaming")]
    Inactive { serial: String },
    #[error("device {serial} has no {kind} stream enabled")]
    MissingStream { serial: String, kind: StreamKind },
    #[error("device {serial} {kind} stream is not a video stream")]
    NotVideoStream { serial: String, kind: StreamKind },
    #[error("device {serial} {kind} stream exposes no intrinsics")]
    NoIntrinsics { serial: String, kind: StreamKind },
    #[error("device {serial} extrinsics query failed: {source}")]
    Extrinsics {
        serial: String,
        #[source]
        source: DriverError,
    },
    #[error("device {serial} pipeline lock poisoned")]
    Poisoned { serial: String },
}

/// A synchronized round did not finish before the caller's deadline.
#[derive(Clone, Debug, Error)]
#[error("synchronization round exceeded {waited:?} (devices: {serials:?})")]
pub struct SynchronizationTimeoutError {
    pub waited: Duration,
    pub serials: Vec<String>,
}

/// A synchronized multi-device round was aborted.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Frame(#[from] FrameRetrievalError),
    #[error(transparent)]
    Timeout(#[from] SynchronizationTimeoutError),
    #[error("synchronization worker exited without a result")]
    WorkerLost,
}

/// A one-shot capture failed.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Frame(#[from] FrameRetrievalError),
}

/// Image encoding failed.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("image buffer {width}x{height} {format} holds {actual} bytes, expected {expected}")]
    BadBuffer {
        width: u32,
        height: u32,
        format: crate::driver::PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("cannot encode {0} pixels")]
    UnsupportedFormat(crate::driver::PixelFormat),
    #[error("image {width}x{height} exceeds the encodable size")]
    Dimensions { width: u64, height: u64 },
    #[error(transparent)]
    Image(#[from] image::ImageError),
}
