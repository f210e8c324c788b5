//! Run orchestration: open, configure, capture, close.

use anyhow::{Context, Result};
use shared::camera_interface::SensorDriver;
use shared::capture::{open_camera, CaptureLoop, ControlManager, LoopSettings, RunMetrics};
use shared::config_storage::{RunConfig, WriteBackMode};
use shared::frame_writer::{FitsEncoder, FrameEncoder, OutputLayout, WriteBackSink};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

/// Run a capture described by `config`, writing FITS files
pub fn execute<D: SensorDriver + ?Sized>(
    driver: &mut D,
    config: &RunConfig,
    stop: Arc<AtomicBool>,
) -> Result<RunMetrics> {
    execute_with_encoder(driver, config, Arc::new(FitsEncoder::new()), stop)
}

/// Run a capture with a caller-chosen encoder.
///
/// The camera is closed before returning, also when the run fails.
pub fn execute_with_encoder<D: SensorDriver + ?Sized>(
    driver: &mut D,
    config: &RunConfig,
    encoder: Arc<dyn FrameEncoder>,
    stop: Arc<AtomicBool>,
) -> Result<RunMetrics> {
    let handle = open_camera(driver, config.camera.serial.as_deref())?;

    let result = capture(driver, handle, config, encoder, stop);

    if let Err(e) = driver.close(handle) {
        warn!("Closing {} failed: {}", handle, e);
    }
    result
}

fn capture<D: SensorDriver + ?Sized>(
    driver: &mut D,
    handle: shared::camera_interface::DeviceHandle,
    config: &RunConfig,
    encoder: Arc<dyn FrameEncoder>,
    stop: Arc<AtomicBool>,
) -> Result<RunMetrics> {
    let mut manager = ControlManager::new();
    let effective = manager
        .configure(driver, handle, &config.capture)
        .context("configuring camera")?;
    let capability = manager.capability(driver, handle)?.clone();

    std::fs::create_dir_all(&config.run.output_dir).with_context(|| {
        format!(
            "creating output directory {}",
            config.run.output_dir.display()
        )
    })?;

    let layout = OutputLayout::new(&config.run.output_dir)
        .with_compression(config.run.compression)
        .with_overwrite(config.run.overwrite);
    let sink = match config.writeback.mode {
        WriteBackMode::Synchronous => WriteBackSink::synchronous(encoder, layout),
        WriteBackMode::Detached => {
            WriteBackSink::detached(encoder, layout, config.writeback.pool())
                .context("starting write-back workers")?
        }
    };

    let mut settings = LoopSettings::for_device(config.run.frame_count, &capability)
        .with_poll_timeout(config.run.poll_timeout())
        .with_timestamp_policy(config.run.timestamp_policy)
        .with_stop_signal(stop);
    if let Some(instrument) = &config.run.instrument {
        settings.instrument = instrument.clone();
    }

    info!(
        "Writing to {} ({} write-back, {} compression)",
        config.run.output_dir.display(),
        if sink.is_detached() { "detached" } else { "synchronous" },
        config.run.compression
    );

    let metrics = CaptureLoop::new(settings)
        .run(driver, handle, &effective, sink)
        .context("capture run failed")?;
    Ok(metrics)
}

/// Write the run metrics as pretty-printed JSON
pub fn write_report(metrics: &RunMetrics, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(metrics)?;
    std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    info!("Run report written to {}", path.display());
    Ok(())
}
