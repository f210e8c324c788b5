//! Print capability metadata and current control values of a camera.

use anyhow::Result;
use clap::Parser;
use capture_bench::args::init_tracing;
use shared::camera_interface::mock::MockSensor;
use shared::camera_interface::{ControlKind, SensorDriver};
use shared::capture::{open_camera, ControlManager};
use shared::image_size::ImageSize;

#[derive(Parser, Debug)]
#[command(author, version, about = "Show sensor capabilities and control ranges")]
struct Args {
    /// Camera serial number
    #[arg(long)]
    serial: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    });

    let mut sensor = MockSensor::new();
    println!("SDK version: {}", sensor.sdk_version());

    let mut cameras: Vec<_> = sensor.enumerate()?.into_iter().collect();
    cameras.sort_by_key(|(_, id)| id.0);
    println!("Connected cameras:");
    for (serial, id) in &cameras {
        println!("  [{}] {}", id.0, serial);
    }

    let handle = open_camera(&mut sensor, args.serial.as_deref())?;
    let mut manager = ControlManager::new();
    let info = manager.capability(&mut sensor, handle)?.clone();

    println!("\n{}", info.name);
    println!("  Sensor:      {}x{} pixels", info.max_width, info.max_height);
    println!("  Pixel size:  {} um", info.pixel_size_um);
    println!("  Bit depth:   {}", info.bit_depth);
    println!("  Color:       {}", info.is_color);
    println!("  Cooler:      {}", info.has_cooler);
    println!("  Formats:     {:?}", info.supported_formats);

    println!("\nROI alignment: {} pixels", info.roi_alignment);
    println!("Full-frame readout per binning:");
    for &bin in &info.supported_bins {
        let size = ImageSize::aligned_full_frame(info.max_size(), bin, info.roi_alignment);
        println!("  bin {bin}: {size}");
    }

    println!("\nControls:");
    for kind in ControlKind::ALL {
        let Some(caps) = info.control(kind) else {
            continue;
        };
        let current = match sensor.get_control(handle, kind) {
            Ok(value) => value.to_string(),
            Err(e) => format!("<{e}>"),
        };
        println!(
            "  {:<14} {:>6}..={:<11} default {:<8} current {:<8} {}",
            kind.name(),
            caps.min,
            caps.max,
            caps.default,
            current,
            if caps.writable { "rw" } else { "ro" }
        );
    }

    sensor.close(handle)?;
    Ok(())
}
