//! calibrate - Offline calibration dump for every attached depth camera
//!
//! This tool:
//! 1. Starts every attached device with color + depth at the requested mode,
//!    projector off unless `--emitter` is given
//! 2. Discards warm-up rounds so auto-exposure settles
//! 3. Polls one final synchronized round across all devices
//! 4. Writes one calibration JSON per device
//! 5. Stops every device, including on error

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use depth_capture::{
    calibration::extract_session,
    config::{CaptureConfig, DriverKind},
    DeviceSessionRegistry, FrameSynchronizer, KindSelection, PixelFormat, SessionOptions,
    StreamSpec,
};

#[path = "../ui.rs"]
mod ui;

/// Projector power applied together with `--emitter`, in milliwatts.
const DEFAULT_LASER_POWER_MW: f32 = 330.0;

#[derive(Parser, Debug)]
#[command(
    name = "calibrate",
    about = "Dump intrinsics and depth-to-color extrinsics for every attached camera"
)]
struct Args {
    /// Stream width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Stream height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Warm-up rounds discarded before reading calibration
    #[arg(long, default_value_t = 150)]
    rounds: u32,

    /// Output directory for calibration JSON files
    #[arg(long, value_name = "DIR", default_value = ".")]
    out: PathBuf,

    /// Camera driver (synthetic|v4l2)
    #[arg(long, default_value = "synthetic", env = "CAPTURE_DRIVER")]
    driver: String,

    /// Enable the depth projector (disabled otherwise)
    #[arg(long)]
    emitter: bool,

    /// Vendor JSON settings preset loaded into every device before streaming
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Give up on a synchronization round after this many seconds
    #[arg(long, value_name = "SECS")]
    round_timeout: Option<u64>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let driver_kind: DriverKind = args.driver.parse()?;
    let mut config = CaptureConfig::load()?;
    config.driver = match driver_kind {
        DriverKind::Synthetic => "synthetic",
        DriverKind::V4l2 => "v4l2",
    }
    .to_string();
    let registry = DeviceSessionRegistry::new(config.build_driver()?);

    let result = run(&args, &ui, &registry);

    let stopped = {
        let _stage = ui.stage("Stop devices");
        registry.stop_all()
    };
    for (serial, outcome) in stopped {
        if !outcome.is_clean() {
            log::warn!("device {} did not stop cleanly", serial);
        }
    }
    result
}

fn run(args: &Args, ui: &ui::Ui, registry: &DeviceSessionRegistry) -> Result<()> {
    let mut options = SessionOptions::new(vec![
        StreamSpec::depth(args.width, args.height, args.fps),
        StreamSpec::color(args.width, args.height, PixelFormat::Rgb8, args.fps),
    ])
    .with_emitter(args.emitter);
    if args.emitter {
        options = options.with_laser_power(DEFAULT_LASER_POWER_MW);
    }
    if let Some(path) = &args.settings {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        options = options.with_preset(json);
    }

    {
        let mut stage = ui.stage("Enable devices");
        let results = registry.start_all(&options)?;
        if results.is_empty() {
            log::warn!("no device found, nothing to calibrate");
            return Ok(());
        }
        if results.iter().all(|(_, result)| result.is_err()) {
            stage.fail();
            return Err(anyhow!("no device could be started"));
        }
    }

    let sessions = registry.active_sessions();
    let synchronizer = FrameSynchronizer::new();
    let kinds = KindSelection::AllEnabled;
    let poll = |synchronizer: &FrameSynchronizer| match args.round_timeout {
        Some(secs) => {
            synchronizer.poll_round_within(&sessions, &kinds, Duration::from_secs(secs))
        }
        None => synchronizer.poll_round(&sessions, &kinds),
    };

    {
        let mut progress = ui.rounds("Warm up", u64::from(args.rounds));
        for _ in 0..args.rounds {
            if let Err(err) = poll(&synchronizer) {
                progress.fail();
                return Err(err.into());
            }
            progress.inc();
        }
    }

    let frames = {
        let _stage = ui.stage("Synchronized round");
        poll(&synchronizer)?
    };
    log::info!("final round holds framesets from {} device(s)", frames.len());

    let _stage = ui.stage("Write calibration");
    std::fs::create_dir_all(&args.out)?;
    for session in &sessions {
        let record = extract_session(session)?;
        let path = output_path(&args.out, session.serial());
        std::fs::write(&path, record.to_json_pretty()?)?;
        println!("saved intrinsics and extrinsics to {}", path.display());
    }
    Ok(())
}

fn output_path(dir: &Path, serial: &str) -> PathBuf {
    dir.join(format!("camera_{serial}_calibration_info.json"))
}
