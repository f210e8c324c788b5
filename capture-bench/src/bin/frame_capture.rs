//! Capture a run of frames to FITS files.
//!
//! Runs against the in-process mock sensor; timeouts and driver drops can be
//! injected to exercise the pipeline without hardware.

use anyhow::Result;
use clap::Parser;
use capture_bench::args::{init_tracing, CommonCaptureArgs};
use capture_bench::run::{execute, write_report};
use shared::camera_interface::mock::MockSensor;
use shared::config_storage::ConfigStorage;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture frames from a sensor to FITS files")]
struct Args {
    #[command(flatten)]
    common: CommonCaptureArgs,

    /// Save the resolved configuration to this YAML file before capturing
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Store the resolved configuration as a named profile
    #[arg(long)]
    save_profile: Option<String>,

    /// Pace the mock sensor at the configured exposure
    #[arg(long)]
    realtime: bool,

    /// Poll indices at which the mock sensor times out (comma separated)
    #[arg(long, value_delimiter = ',')]
    mock_timeouts: Vec<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.common.log_level());

    let config = args.common.resolve()?;

    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        info!("Saved configuration to {}", path.display());
    }
    if let Some(name) = &args.save_profile {
        let path = ConfigStorage::new()?.save_profile(name, &config)?;
        info!("Saved profile {} to {}", name, path.display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("Stop requested, finishing current poll...");
        handler_stop.store(true, Ordering::SeqCst);
    })?;

    let mut sensor = MockSensor::new()
        .realtime(args.realtime)
        .timeouts_at(&args.mock_timeouts);
    if let Some(serial) = &config.camera.serial {
        sensor = sensor.serial(serial);
    }

    let metrics = execute(&mut sensor, &config, stop)?;
    println!("{metrics}");

    if let Some(path) = &args.common.report {
        write_report(&metrics, path)?;
    }

    Ok(())
}
