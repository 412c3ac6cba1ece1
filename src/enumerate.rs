//! Device enumeration.

use std::sync::Arc;

use serde::Serialize;

use crate::driver::Driver;
use crate::error::HardwareContextError;

/// Names of entries some hosts report alongside real sensors.
pub const PSEUDO_DEVICE_NAMES: &[&str] = &["platform camera"];

/// One physical depth camera. Identity is the serial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub product_line: String,
}

/// Lists the physical devices behind a driver context.
#[derive(Clone)]
pub struct DeviceEnumerator {
    driver: Arc<dyn Driver>,
}

impl DeviceEnumerator {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Query the live driver context, dropping pseudo-devices. Zero attached
    /// devices is an empty list, not an error.
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, HardwareContextError> {
        let infos = self.driver.query_devices().map_err(HardwareContextError)?;
        let mut devices: Vec<DeviceDescriptor> = infos
            .into_iter()
            .filter(|info| !is_pseudo_device(&info.name))
            .map(|info| DeviceDescriptor {
                serial: info.serial,
                display_name: info.name,
                product_line: info.product_line,
            })
            .collect();
        devices.sort_by(|a, b| a.serial.cmp(&b.serial));
        devices.dedup_by(|a, b| a.serial == b.serial);
        log::info!(
            "found {} depth camera(s) via {} driver",
            devices.len(),
            self.driver.name()
        );
        Ok(devices)
    }

    /// Descriptor of one attached physical device.
    pub fn find(&self, serial: &str) -> Result<Option<DeviceDescriptor>, HardwareContextError> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|device| device.serial == serial))
    }
}

fn is_pseudo_device(name: &str) -> bool {
    PSEUDO_DEVICE_NAMES
        .iter()
        .any(|sentinel| name.trim().eq_ignore_ascii_case(sentinel))
}
