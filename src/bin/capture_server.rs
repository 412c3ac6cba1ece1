//! capture_server - HTTP service for interactive depth capture
//!
//! This daemon:
//! 1. Loads configuration (CAPTURE_CONFIG file + CAPTURE_* env overrides)
//! 2. Opens the configured camera driver
//! 3. Serves device listing, start/stop, capture, calibration and video feeds
//! 4. Stops every running device on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;

use depth_capture::{
    api::{ApiConfig, ApiServer},
    config::CaptureConfig,
    DeviceSessionRegistry, StopOutcome,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CaptureConfig::load()?;
    let driver = config.build_driver()?;
    log::info!(
        "capture_server using {} driver, {}x{} @ {} fps",
        driver.name(),
        config.image_width,
        config.image_height,
        config.fps
    );
    let registry = Arc::new(DeviceSessionRegistry::new(driver));

    match registry.enumerator().list_devices() {
        Ok(devices) => {
            for device in &devices {
                log::info!(
                    "available: {} {} ({})",
                    device.product_line,
                    device.serial,
                    device.display_name
                );
            }
        }
        Err(err) => log::warn!("initial enumeration failed: {}", err),
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        data_dir: config.data_dir.clone(),
        session: config.session_options()?,
        feed: config.feed_settings()?,
    };
    let api_handle = ApiServer::new(api_config, Arc::clone(&registry)).spawn()?;
    log::info!(
        "capture_server running. serving {} from {}",
        api_handle.addr,
        config.data_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("capture_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping devices...");
    for (serial, outcome) in registry.stop_all() {
        if let StopOutcome::Faulted(err) = outcome {
            log::warn!("device {} released with fault: {}", serial, err);
        }
    }
    api_handle.stop()?;

    Ok(())
}
