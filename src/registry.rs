//! Registry of live device sessions.
//!
//! The registry is the only thing that adds or removes sessions, and the
//! single source of truth for "is this device streaming". A serial is present
//! in the map if and only if its hardware pipeline is started.
//!
//! Lifecycle calls (`start`, `stop`) are serialized per serial through a gate
//! mutex, so two concurrent starts can never race to build two pipelines for
//! one device. Gates are per serial: a slow stop on one camera (which has to
//! wait out an in-flight frame wait) never stalls lifecycle calls on another.
//! A gate lives only while its serial has a session or a caller waiting on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::align::Aligner;
use crate::driver::{Driver, DriverError, Pipeline, StreamKind, StreamSpec};
use crate::enumerate::{DeviceDescriptor, DeviceEnumerator};
use crate::error::{HardwareContextError, NotFoundError, StartError, StopError};
use crate::session::DeviceSession;

/// How to start a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionOptions {
    pub streams: Vec<StreamSpec>,
    /// Reproject depth onto the color grid on every frameset.
    pub enable_alignment: bool,
    /// Force the depth projector on or off. `None` leaves the device default.
    pub emitter: Option<bool>,
    /// Projector power in milliwatts.
    pub laser_power: Option<f32>,
    /// Vendor JSON settings preset loaded before streaming.
    pub preset: Option<String>,
}

impl SessionOptions {
    pub fn new(streams: Vec<StreamSpec>) -> Self {
        Self {
            streams,
            enable_alignment: false,
            emitter: None,
            laser_power: None,
            preset: None,
        }
    }

    pub fn with_alignment(mut self, enable: bool) -> Self {
        self.enable_alignment = enable;
        self
    }

    pub fn with_emitter(mut self, enabled: bool) -> Self {
        self.emitter = Some(enabled);
        self
    }

    pub fn with_laser_power(mut self, milliwatts: f32) -> Self {
        self.laser_power = Some(milliwatts);
        self
    }

    pub fn with_preset(mut self, json: impl Into<String>) -> Self {
        self.preset = Some(json.into());
        self
    }
}

/// Result of a stop that found its session.
#[derive(Debug)]
pub enum StopOutcome {
    Released,
    /// The driver reported a fault while stopping. The session was removed
    /// anyway.
    Faulted(StopError),
}

impl StopOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, StopOutcome::Released)
    }
}

pub struct DeviceSessionRegistry {
    driver: Arc<dyn Driver>,
    enumerator: DeviceEnumerator,
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceSessionRegistry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            enumerator: DeviceEnumerator::new(Arc::clone(&driver)),
            driver,
            sessions: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn enumerator(&self) -> &DeviceEnumerator {
        &self.enumerator
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<DeviceSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<DeviceSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(serial.to_string()).or_default())
    }

    /// Drop the gate of a serial that has no session and no other caller
    /// queued on it, so unknown serials never accumulate.
    fn retire_gate(&self, serial: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in `gate`.
        if Arc::strong_count(&gate) == 2 && !self.is_active(serial) {
            gates.remove(serial);
        }
    }

    /// Start `serial` with the given streams. Starting an active serial is a
    /// no-op success.
    pub fn start(
        &self,
        serial: &str,
        streams: &[StreamSpec],
        enable_alignment: bool,
    ) -> Result<(), StartError> {
        let options = SessionOptions::new(streams.to_vec()).with_alignment(enable_alignment);
        self.start_with(serial, &options)
    }

    /// Full form of [`Self::start`].
    ///
    /// On any failure the hardware pipeline (if one was opened) is released
    /// and no session is registered.
    pub fn start_with(&self, serial: &str, options: &SessionOptions) -> Result<(), StartError> {
        let gate = self.gate(serial);
        let result = {
            let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
            self.start_gated(serial, options)
        };
        self.retire_gate(serial, gate);
        result
    }

    fn start_gated(&self, serial: &str, options: &SessionOptions) -> Result<(), StartError> {
        if self.is_active(serial) {
            log::warn!("stream already running for device {}", serial);
            return Ok(());
        }

        let descriptor =
            self.enumerator
                .find(serial)?
                .ok_or_else(|| StartError::UnknownDevice {
                    serial: serial.to_string(),
                })?;

        let mut pipeline = self
            .driver
            .open_pipeline(serial, &options.streams)
            .map_err(|source| StartError::from_driver(serial, source))?;

        if let Err(source) = apply_device_settings(serial, pipeline.as_mut(), options) {
            release_after_failed_start(serial, pipeline);
            return Err(StartError::Refused {
                serial: serial.to_string(),
                source,
            });
        }

        let aligner = if options.enable_alignment {
            match build_aligner(pipeline.as_ref()) {
                Ok(aligner) => Some(aligner),
                Err(reason) => {
                    release_after_failed_start(serial, pipeline);
                    return Err(StartError::Alignment {
                        serial: serial.to_string(),
                        reason,
                    });
                }
            }
        } else {
            None
        };

        let session = Arc::new(DeviceSession::new(descriptor, pipeline, aligner));
        log::info!(
            "started streaming from device {} ({}, streams {:?}, aligned={})",
            serial,
            session.product_line(),
            session.enabled_kinds(),
            session.is_aligned()
        );
        self.write().insert(serial.to_string(), session);
        Ok(())
    }

    /// Enumerate attached devices and start each one. A device that fails to
    /// start is logged and skipped; the others still start.
    pub fn start_all(
        &self,
        options: &SessionOptions,
    ) -> Result<Vec<(DeviceDescriptor, Result<(), StartError>)>, HardwareContextError> {
        let devices = self.enumerator.list_devices()?;
        log::info!("{} device(s) have been found", devices.len());
        let results = devices
            .into_iter()
            .map(|device| {
                log::info!("launching {} {}", device.product_line, device.serial);
                let result = self.start_with(&device.serial, options);
                if let Err(err) = &result {
                    log::error!("failed to enable device {}: {}", device.serial, err);
                }
                (device, result)
            })
            .collect();
        Ok(results)
    }

    /// Stop the hardware pipeline, then remove the session.
    ///
    /// Waits for an in-flight frame wait on the session to finish. A driver
    /// fault during stop is logged and returned as `StopOutcome::Faulted`;
    /// the session is removed either way.
    pub fn stop(&self, serial: &str) -> Result<StopOutcome, NotFoundError> {
        let gate = self.gate(serial);
        let result = {
            let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
            self.stop_gated(serial)
        };
        self.retire_gate(serial, gate);
        result
    }

    fn stop_gated(&self, serial: &str) -> Result<StopOutcome, NotFoundError> {
        let session = self.get(serial).ok_or_else(|| {
            log::error!("no active stream found for device {}", serial);
            NotFoundError::new(serial)
        })?;

        let outcome = match session.shutdown() {
            Ok(()) => {
                log::info!("stopped streaming from device {}", serial);
                StopOutcome::Released
            }
            Err(source) => {
                let err = StopError {
                    serial: serial.to_string(),
                    source,
                };
                log::warn!("error stopping pipeline: {}", err);
                StopOutcome::Faulted(err)
            }
        };
        self.write().remove(serial);
        Ok(outcome)
    }

    /// Stop every active session.
    pub fn stop_all(&self) -> Vec<(String, StopOutcome)> {
        self.active_serials()
            .into_iter()
            .filter_map(|serial| {
                // A concurrent stop may have removed it already.
                let outcome = self.stop(&serial).ok()?;
                Some((serial, outcome))
            })
            .collect()
    }

    pub fn is_active(&self, serial: &str) -> bool {
        self.read().contains_key(serial)
    }

    /// Shared handle to a live session. Pipeline access still goes through
    /// the session's own lock.
    pub fn get(&self, serial: &str) -> Option<Arc<DeviceSession>> {
        self.read().get(serial).cloned()
    }

    pub fn active_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.read().keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Snapshot of live sessions, ordered by serial.
    pub fn active_sessions(&self) -> Vec<Arc<DeviceSession>> {
        let mut sessions: Vec<Arc<DeviceSession>> = self.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.serial().cmp(b.serial()));
        sessions
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Drop for DeviceSessionRegistry {
    fn drop(&mut self) {
        let sessions = std::mem::take(&mut *self.write());
        for (serial, session) in sessions {
            if let Err(err) = session.shutdown() {
                log::debug!("device {} released on drop: {}", serial, err);
            }
        }
    }
}

fn build_aligner(pipeline: &dyn Pipeline) -> Result<Aligner, String> {
    let extrinsics = pipeline
        .extrinsics(StreamKind::Depth, StreamKind::Color)
        .map_err(|err| err.to_string())?;
    Aligner::new(pipeline.profile(), StreamKind::Color, extrinsics)
}

/// Preset first, since loading one may reset the projector options.
fn apply_device_settings(
    serial: &str,
    pipeline: &mut dyn Pipeline,
    options: &SessionOptions,
) -> Result<(), DriverError> {
    if let Some(preset) = &options.preset {
        if pipeline.load_preset(preset)? {
            log::info!("device {} loaded settings preset", serial);
        } else {
            log::debug!("device {} has no advanced mode for presets", serial);
        }
    }
    if let Some(enabled) = options.emitter {
        if pipeline.set_emitter(enabled)? {
            log::info!(
                "device {} emitter {}",
                serial,
                if enabled { "enabled" } else { "disabled" }
            );
        } else {
            log::debug!("device {} has no controllable emitter", serial);
        }
    }
    if let Some(milliwatts) = options.laser_power {
        if pipeline.set_laser_power(milliwatts)? {
            log::info!("device {} laser power {} mW", serial, milliwatts);
        } else {
            log::debug!("device {} has no adjustable laser power", serial);
        }
    }
    Ok(())
}

fn release_after_failed_start(serial: &str, mut pipeline: Box<dyn Pipeline>) {
    if let Err(err) = pipeline.stop() {
        log::warn!(
            "device {} did not stop cleanly after failed start: {}",
            serial,
            err
        );
    }
}
