//! Depth Capture
//!
//! Multi-device acquisition for depth cameras: enumeration, per-device
//! session lifecycle, synchronized multi-device polling, calibration
//! extraction, and a continuous per-device frame feed with fallback.
//!
//! # Architecture
//!
//! Hardware sits behind the [`driver::Driver`] / [`driver::Pipeline`] traits.
//! Everything above that seam works on owned values:
//!
//! 1. **Registry owns sessions**: only [`DeviceSessionRegistry`] adds or
//!    removes sessions; a serial is present iff its pipeline is started.
//! 2. **One lock per pipeline**: every call that touches a pipeline handle
//!    goes through that session's lock. Nothing else is held during a frame
//!    wait.
//! 3. **Streaming never fails**: [`FrameFeed`] substitutes a fallback chunk
//!    for any hardware error or missing session.
//! 4. **One-shot paths surface errors**: start, stop, capture and
//!    calibration return typed errors from [`error`].
//!
//! # Module Structure
//!
//! - `driver`: hardware seam, synthetic rig, optional V4L2 backend
//! - `enumerate`, `session`, `registry`: device discovery and lifecycle
//! - `sync`: barrier polling across devices
//! - `calibration`, `capture`: one-shot reads from a live session
//! - `feed`: multipart frame feed
//! - `frame`, `align`: pixel buffers, encoding, depth→color reprojection
//! - `config`, `api`: service configuration and HTTP surface

pub mod align;
pub mod api;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod driver;
pub mod enumerate;
pub mod error;
pub mod feed;
pub mod frame;
pub mod registry;
pub mod session;
pub mod sync;

pub use calibration::{CalibrationExtractor, CalibrationRecord, PinholeParams};
pub use capture::{capture_once, Capture};
pub use driver::{Driver, Pipeline, PixelFormat, StreamKind, StreamSpec};
pub use enumerate::{DeviceDescriptor, DeviceEnumerator};
pub use error::{
    CalibrationError, CaptureError, FrameRetrievalError, HardwareContextError, NotFoundError,
    StartError, StopError, SyncError, SynchronizationTimeoutError,
};
pub use feed::{FeedLayout, FeedSettings, FeedTick, FrameFeed, FrameFeedGenerator};
pub use frame::{FrameSet, ImageBuffer};
pub use registry::{DeviceSessionRegistry, SessionOptions, StopOutcome};
pub use session::DeviceSession;
pub use sync::{FrameSynchronizer, KindSelection};
