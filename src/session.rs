//! Live binding between one physical camera and its running pipeline.
//!
//! A `DeviceSession` owns the pipeline handle behind a single mutex. Every
//! operation that touches the handle (frame wait, capture, extrinsics query,
//! stop) goes through that mutex, so the driver never sees concurrent calls
//! on one pipeline. The blocking frame wait runs while holding only this lock;
//! alignment and everything after it run with the lock released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::align::Aligner;
use crate::driver::{DriverError, DriverErrorKind, Pipeline, PipelineProfile, StreamKind};
use crate::enumerate::DeviceDescriptor;
use crate::error::FrameRetrievalError;
use crate::frame::FrameSet;

type PipelineSlot = Option<Box<dyn Pipeline>>;

pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    profile: PipelineProfile,
    aligner: Option<Aligner>,
    /// `None` once the hardware pipeline has been stopped.
    pipeline: Mutex<PipelineSlot>,
    running: AtomicBool,
    frames_delivered: AtomicU64,
    started_at: Instant,
}

impl DeviceSession {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        pipeline: Box<dyn Pipeline>,
        aligner: Option<Aligner>,
    ) -> Self {
        Self {
            descriptor,
            profile: pipeline.profile().clone(),
            aligner,
            pipeline: Mutex::new(Some(pipeline)),
            running: AtomicBool::new(true),
            frames_delivered: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.descriptor.serial
    }

    pub fn product_line(&self) -> &str {
        &self.descriptor.product_line
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Stream set negotiated when the pipeline started.
    pub fn profile(&self) -> &PipelineProfile {
        &self.profile
    }

    pub fn enabled_kinds(&self) -> Vec<StreamKind> {
        self.profile.kinds()
    }

    pub fn is_aligned(&self) -> bool {
        self.aligner.is_some()
    }

    /// False once the session has been stopped. Holders of a stale handle see
    /// `FrameRetrievalError::Inactive` from then on.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn lock(&self) -> Result<MutexGuard<'_, PipelineSlot>, FrameRetrievalError> {
        self.pipeline
            .lock()
            .map_err(|_| FrameRetrievalError::Poisoned {
                serial: self.serial().to_string(),
            })
    }

    /// Run `f` against the pipeline under the session lock.
    pub(crate) fn with_pipeline<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn Pipeline>) -> T,
    ) -> Result<T, FrameRetrievalError> {
        let mut slot = self.lock()?;
        let pipeline = slot
            .as_mut()
            .ok_or_else(|| FrameRetrievalError::Inactive {
                serial: self.serial().to_string(),
            })?;
        Ok(f(pipeline))
    }

    /// Block for the next frame bundle and key it by stream kind. When the
    /// session was started with alignment, depth is reprojected onto the
    /// color grid. The result may be partial; see [`Self::capture`].
    pub fn wait_for_frameset(&self) -> Result<FrameSet, FrameRetrievalError> {
        let bundle = self
            .with_pipeline(|pipeline| pipeline.wait_for_frames())?
            .map_err(|source| FrameRetrievalError::Hardware {
                serial: self.serial().to_string(),
                source,
            })?;
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);

        let mut frames = FrameSet::from_bundle(self.serial(), bundle);
        if let Some(aligner) = &self.aligner {
            aligner.process(&mut frames);
        }
        Ok(frames)
    }

    /// Wait for one frameset that holds every `required` kind.
    pub fn capture(&self, required: &[StreamKind]) -> Result<FrameSet, FrameRetrievalError> {
        let frames = self.wait_for_frameset()?;
        let missing = frames.missing(required);
        if !missing.is_empty() {
            return Err(FrameRetrievalError::Incomplete {
                serial: self.serial().to_string(),
                missing,
            });
        }
        Ok(frames)
    }

    /// Stop the hardware pipeline. Waits for any in-flight frame wait to
    /// finish first. The handle is released even if the driver reports a
    /// fault while stopping.
    pub(crate) fn shutdown(&self) -> Result<(), DriverError> {
        let mut slot = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        self.running.store(false, Ordering::SeqCst);
        let Some(mut pipeline) = slot.take() else {
            return Err(DriverError::new(
                DriverErrorKind::Stopped,
                "pipeline already stopped",
            ));
        };
        pipeline.stop()
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.descriptor.serial)
            .field("product_line", &self.descriptor.product_line)
            .field("streams", &self.profile.kinds())
            .field("aligned", &self.aligner.is_some())
            .field("running", &self.is_running())
            .finish()
    }
}
