//! Command line arguments shared by the capture binaries.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use shared::camera_interface::PixelFormat;
use shared::capture::{RegionSize, TimestampPolicy};
use shared::config_storage::{ConfigStorage, RunConfig, WriteBackMode};
use shared::frame_writer::{Compression, SaturationPolicy};
use shared::image_size::ImageSize;
use std::path::PathBuf;
use std::time::Duration;

/// Parse duration string with units (e.g., "20ms", "500us", "1.5s")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = s.strip_suffix("us") {
        (num, "us")
    } else if let Some(num) = s.strip_suffix('s') {
        (num, "s")
    } else {
        // Default to milliseconds if no unit specified
        (s, "ms")
    };

    let value: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid numeric value: {num_str}"))?;

    if value < 0.0 || !value.is_finite() {
        return Err("Duration must be a non-negative number".to_string());
    }

    // Whole microseconds, matching the exposure control resolution
    let micros = match unit {
        "us" => value,
        "ms" => value * 1e3,
        _ => value * 1e6,
    };

    Ok(Duration::from_micros(micros.round() as u64))
}

/// Duration argument accepting us/ms/s suffixes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationArg(pub Duration);

impl std::str::FromStr for DurationArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(DurationArg)
    }
}

impl std::fmt::Display for DurationArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let micros = self.0.as_micros();
        if micros % 1000 != 0 {
            write!(f, "{micros}us")
        } else {
            write!(f, "{}ms", micros / 1000)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PixelFormatArg {
    Raw8,
    Rgb24,
    Raw16,
    Y8,
}

impl From<PixelFormatArg> for PixelFormat {
    fn from(arg: PixelFormatArg) -> Self {
        match arg {
            PixelFormatArg::Raw8 => PixelFormat::Raw8,
            PixelFormatArg::Rgb24 => PixelFormat::Rgb24,
            PixelFormatArg::Raw16 => PixelFormat::Raw16,
            PixelFormatArg::Y8 => PixelFormat::Y8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompressionArg {
    None,
    Rice,
    Gzip,
    Plio,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Rice => Compression::Rice,
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::Plio => Compression::Plio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WriteBackArg {
    /// Write on the capture thread
    Sync,
    /// Write on a worker pool
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TimestampArg {
    /// Each exposure starts where the previous ended
    Chained,
    /// Leave a gap for every frame the driver dropped
    Resync,
}

/// Arguments common to every capture binary.
///
/// Values given here override the run configuration file or profile.
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonCaptureArgs {
    /// YAML run configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Named profile from ~/.cf_config/capture_profiles
    #[arg(long, conflicts_with = "config")]
    pub profile: Option<String>,

    /// Camera serial number
    #[arg(long)]
    pub serial: Option<String>,

    /// Number of poll attempts
    #[arg(short = 'n', long)]
    pub frames: Option<u64>,

    /// Exposure time (e.g., "20ms", "500us", "1.5s")
    #[arg(short, long)]
    pub exposure: Option<DurationArg>,

    #[arg(short, long)]
    pub gain: Option<i64>,

    #[arg(short, long)]
    pub binning: Option<u32>,

    /// Region width in binned pixels (requires --height)
    #[arg(long, requires = "height")]
    pub width: Option<u32>,

    /// Region height in binned pixels (requires --width)
    #[arg(long, requires = "width")]
    pub height: Option<u32>,

    /// Region start column in binned pixels
    #[arg(long)]
    pub start_x: Option<u32>,

    /// Region start row in binned pixels
    #[arg(long)]
    pub start_y: Option<u32>,

    /// Request the largest aligned readout for the binning
    #[arg(long, conflicts_with_all = ["width", "height"])]
    pub full_frame: bool,

    #[arg(long, value_enum)]
    pub format: Option<PixelFormatArg>,

    /// Enable the cooler with this set point in degrees Celsius
    #[arg(long, allow_negative_numbers = true)]
    pub cooler_temp: Option<f64>,

    /// Output directory for captured frames
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub compression: Option<CompressionArg>,

    /// Replace existing frame files
    #[arg(long)]
    pub overwrite: bool,

    #[arg(long, value_enum)]
    pub writeback: Option<WriteBackArg>,

    /// Write-back worker threads
    #[arg(long)]
    pub workers: Option<usize>,

    /// Frames that may wait for a write-back worker
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// Discard frames instead of waiting when the write-back queue is full
    #[arg(long)]
    pub drop_when_full: bool,

    #[arg(long, value_enum)]
    pub timestamps: Option<TimestampArg>,

    /// Bound on a single frame poll (e.g., "500ms")
    #[arg(long)]
    pub poll_timeout: Option<DurationArg>,

    /// INSTRUME header value
    #[arg(long)]
    pub instrument: Option<String>,

    /// Write a JSON run report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl CommonCaptureArgs {
    /// Base configuration from --config, --profile or defaults
    pub fn base_config(&self) -> Result<RunConfig> {
        if let Some(path) = &self.config {
            return RunConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()));
        }
        if let Some(name) = &self.profile {
            let storage = ConfigStorage::new().context("locating config storage")?;
            return match storage.get_profile(name) {
                Some(result) => result.with_context(|| format!("loading profile {name}")),
                None => bail!("no capture profile named {name}"),
            };
        }
        Ok(RunConfig::default())
    }

    /// Apply command line overrides on top of `config`
    pub fn apply(&self, config: &mut RunConfig) -> Result<()> {
        if let Some(serial) = &self.serial {
            config.camera.serial = Some(serial.clone());
        }

        let capture = &mut config.capture;
        if let Some(exposure) = self.exposure {
            let micros = exposure.0.as_micros();
            capture.exposure_us = u64::try_from(micros).context("exposure too long")?;
        }
        if let Some(gain) = self.gain {
            capture.gain = gain;
        }
        if let Some(binning) = self.binning {
            capture.binning = binning;
        }
        if let Some(format) = self.format {
            capture.pixel_format = format.into();
        }
        match (self.width, self.height) {
            (Some(width), Some(height)) => {
                capture.region.size = RegionSize::Explicit(ImageSize::from_width_height(width, height));
            }
            (None, None) if self.full_frame => capture.region.size = RegionSize::FullFrame,
            (None, None) => {}
            _ => bail!("--width and --height must be given together"),
        }
        if let Some(x) = self.start_x {
            capture.region.x = x;
        }
        if let Some(y) = self.start_y {
            capture.region.y = y;
        }
        if let Some(target) = self.cooler_temp {
            capture.cooler_enabled = true;
            capture.target_temperature_c = target;
        }

        let run = &mut config.run;
        if let Some(frames) = self.frames {
            run.frame_count = frames;
        }
        if let Some(output) = &self.output {
            run.output_dir = output.clone();
        }
        if let Some(compression) = self.compression {
            run.compression = compression.into();
        }
        if self.overwrite {
            run.overwrite = true;
        }
        if let Some(timestamps) = self.timestamps {
            run.timestamp_policy = match timestamps {
                TimestampArg::Chained => TimestampPolicy::Chained,
                TimestampArg::Resync => TimestampPolicy::ResyncOnDrop,
            };
        }
        if let Some(timeout) = self.poll_timeout {
            run.poll_timeout_ms = u64::try_from(timeout.0.as_millis()).context("poll timeout too long")?;
        }
        if let Some(instrument) = &self.instrument {
            run.instrument = Some(instrument.clone());
        }

        let writeback = &mut config.writeback;
        if let Some(mode) = self.writeback {
            writeback.mode = match mode {
                WriteBackArg::Sync => WriteBackMode::Synchronous,
                WriteBackArg::Detached => WriteBackMode::Detached,
            };
        }
        if let Some(workers) = self.workers {
            writeback.workers = workers;
        }
        if let Some(depth) = self.queue_depth {
            writeback.queue_depth = depth;
        }
        if self.drop_when_full {
            writeback.when_full = SaturationPolicy::Drop;
        }

        config.validate()?;
        Ok(())
    }

    /// Base configuration with all overrides applied
    pub fn resolve(&self) -> Result<RunConfig> {
        let mut config = self.base_config()?;
        self.apply(&mut config)?;
        Ok(config)
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

/// Initialize tracing for a capture binary
pub fn init_tracing(level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::capture::Region;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        common: CommonCaptureArgs,
    }

    fn parse(args: &[&str]) -> CommonCaptureArgs {
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).common
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("20ms").unwrap(), Duration::from_millis(20));
        assert_eq!(parse_duration("500us").unwrap(), Duration::from_micros(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(DurationArg(Duration::from_millis(20)).to_string(), "20ms");
        assert_eq!(DurationArg(Duration::from_micros(1500)).to_string(), "1500us");
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut config = RunConfig::default();
        config.capture.gain = 50;
        config.run.frame_count = 100;

        let args = parse(&[
            "--frames", "20", "--exposure", "20ms", "--binning", "2", "--width", "400", "--height",
            "400", "--gain", "120", "--writeback", "sync",
        ]);
        args.apply(&mut config).unwrap();

        assert_eq!(config.run.frame_count, 20);
        assert_eq!(config.capture.exposure_us, 20_000);
        assert_eq!(config.capture.binning, 2);
        assert_eq!(config.capture.gain, 120);
        assert_eq!(config.capture.region, Region::explicit(0, 0, 400, 400));
        assert_eq!(config.writeback.mode, WriteBackMode::Synchronous);
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let mut config = RunConfig::default();
        config.capture.gain = 50;
        config.writeback.when_full = SaturationPolicy::Drop;
        let before = config.clone();

        parse(&[]).apply(&mut config).unwrap();
        assert_eq!(config, before);
    }

    #[test]
    fn test_cooler_flag_enables_cooler() {
        let mut config = RunConfig::default();
        parse(&["--cooler-temp", "-10"]).apply(&mut config).unwrap();
        assert!(config.capture.cooler_enabled);
        assert_eq!(config.capture.target_temperature_c, -10.0);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = RunConfig::default();
        let result = parse(&["--binning", "0"]).apply(&mut config);
        assert!(result.is_err());
    }
}
