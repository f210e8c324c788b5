//! Control-parameter manager.
//!
//! Validates a [`CaptureConfig`] against the device's capability metadata,
//! applies it in the order the device requires (region+binning+format, then
//! offset, then scalar controls) and returns the values the device confirmed.
//! Nothing is retried and nothing is rolled back: after an error the caller
//! must reconfigure fully or abort.

use super::{check_physical, CaptureConfig, CaptureError, Region, RegionSize};
use crate::camera_interface::{
    CapabilityInfo, ControlKind, DeviceError, DeviceHandle, SensorDriver,
};
use crate::image_size::ImageSize;
use std::fmt::Display;
use tracing::{debug, info, warn};

/// Open and initialize a camera, optionally selected by serial number.
///
/// Without a serial the camera with the lowest enumeration index is used.
pub fn open_camera<D: SensorDriver + ?Sized>(
    driver: &mut D,
    serial: Option<&str>,
) -> Result<DeviceHandle, CaptureError> {
    info!("Sensor SDK version {}", driver.sdk_version());

    let cameras = driver
        .enumerate()
        .map_err(|e| CaptureError::fatal("enumerate", e))?;

    let id = match serial {
        Some(serial) => cameras.get(serial).copied().ok_or_else(|| {
            CaptureError::fatal(
                "enumerate",
                DeviceError::NotFound(format!("serial {serial}")),
            )
        })?,
        None => cameras.values().min().copied().ok_or_else(|| {
            CaptureError::fatal(
                "enumerate",
                DeviceError::NotFound("no cameras connected".to_string()),
            )
        })?,
    };

    let handle = driver
        .open(id)
        .map_err(|e| CaptureError::fatal("open", e))?;
    driver
        .init(handle)
        .map_err(|e| CaptureError::fatal("init", e))?;

    info!("Opened {} (id {})", handle, id.0);
    Ok(handle)
}

fn device_failure(parameter: &str, requested: impl Display, err: DeviceError) -> CaptureError {
    if err.is_fatal() {
        CaptureError::fatal(format!("configure {parameter}"), err)
    } else {
        CaptureError::config(parameter, requested, err.to_string())
    }
}

/// Applies acquisition parameters to an opened device
#[derive(Debug, Default)]
pub struct ControlManager {
    capability: Option<CapabilityInfo>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability metadata, queried from the device on first use only
    pub fn capability<D: SensorDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        handle: DeviceHandle,
    ) -> Result<&CapabilityInfo, CaptureError> {
        if self.capability.is_none() {
            let info = driver
                .get_capability(handle)
                .map_err(|e| CaptureError::fatal("capability query", e))?;
            debug!(
                "Capabilities for {}: {}x{}, bins {:?}, alignment {}",
                info.name, info.max_width, info.max_height, info.supported_bins, info.roi_alignment
            );
            self.capability = Some(info);
        }
        self.capability
            .as_ref()
            .ok_or_else(|| CaptureError::Capture("capability cache empty".to_string()))
    }

    /// Cached capability metadata without touching the device
    pub fn cached_capability(&self) -> Option<&CapabilityInfo> {
        self.capability.as_ref()
    }

    /// Apply `desired` and return the effective, device-confirmed configuration
    pub fn configure<D: SensorDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        handle: DeviceHandle,
        desired: &CaptureConfig,
    ) -> Result<CaptureConfig, CaptureError> {
        let caps = self.capability(driver, handle)?.clone();

        let size = resolve_region(&caps, desired)?;

        driver
            .set_region(handle, size, desired.binning, desired.pixel_format)
            .map_err(|e| device_failure("region", format!("{size} bin {}", desired.binning), e))?;
        let confirmed = driver
            .get_region(handle)
            .map_err(|e| CaptureError::fatal("region read-back", e))?;
        let fits_sensor = |extent: u32, max: u32| {
            extent != 0
                && confirmed
                    .binning
                    .checked_mul(extent)
                    .is_some_and(|px| px <= max)
        };
        if confirmed.binning == 0
            || !fits_sensor(confirmed.size.width, caps.max_width)
            || !fits_sensor(confirmed.size.height, caps.max_height)
        {
            return Err(CaptureError::Capture(format!(
                "region read-back {} at bin {} is outside the sensor",
                confirmed.size, confirmed.binning
            )));
        }
        if confirmed.size != size || confirmed.binning != desired.binning {
            warn!(
                "Device adjusted region {} bin {} to {} bin {}",
                size, desired.binning, confirmed.size, confirmed.binning
            );
        }

        let (x, y) = (desired.region.x, desired.region.y);
        driver
            .set_offset(handle, x, y)
            .map_err(|e| device_failure("offset", format!("({x}, {y})"), e))?;
        let (x, y) = driver
            .get_offset(handle)
            .map_err(|e| CaptureError::fatal("offset read-back", e))?;
        let binned_width = caps.max_width / confirmed.binning;
        let binned_height = caps.max_height / confirmed.binning;
        if !span_fits(x, confirmed.size.width, binned_width)
            || !span_fits(y, confirmed.size.height, binned_height)
        {
            return Err(CaptureError::Capture(format!(
                "offset read-back ({x}, {y}) for {} at bin {} is outside the sensor",
                confirmed.size, confirmed.binning
            )));
        }

        let gain = apply_control(driver, handle, &caps, ControlKind::Gain, desired.gain)?;

        let exposure_raw = i64::try_from(desired.exposure_us)
            .map_err(|_| CaptureError::config("exposure_us", desired.exposure_us, "too large"))?;
        let exposure_us =
            apply_control(driver, handle, &caps, ControlKind::Exposure, exposure_raw)? as u64;

        let hardware_binning = if caps.control(ControlKind::HardwareBin).is_some() {
            let raw = apply_control(
                driver,
                handle,
                &caps,
                ControlKind::HardwareBin,
                desired.hardware_binning as i64,
            )?;
            raw != 0
        } else if desired.hardware_binning {
            return Err(CaptureError::config(
                "hardware_binning",
                true,
                "device has no hardware binning",
            ));
        } else {
            false
        };

        let (cooler_enabled, target_temperature_c) = if caps.has_cooler {
            let cooler = apply_control(
                driver,
                handle,
                &caps,
                ControlKind::CoolerOn,
                desired.cooler_enabled as i64,
            )?;
            let target = apply_control(
                driver,
                handle,
                &caps,
                ControlKind::TargetTemperature,
                desired.target_temperature_c.round() as i64,
            )?;
            (cooler != 0, target as f64)
        } else if desired.cooler_enabled {
            return Err(CaptureError::config(
                "cooler_enabled",
                true,
                "device has no cooler",
            ));
        } else {
            (false, desired.target_temperature_c)
        };

        let offset = desired
            .offset
            .map(|value| apply_control(driver, handle, &caps, ControlKind::Offset, value))
            .transpose()?;
        let usb_bandwidth = desired
            .usb_bandwidth
            .map(|value| {
                apply_control(driver, handle, &caps, ControlKind::BandwidthOverload, value)
            })
            .transpose()?;
        let high_speed_mode = desired
            .high_speed_mode
            .map(|value| {
                apply_control(driver, handle, &caps, ControlKind::HighSpeedMode, value as i64)
                    .map(|raw| raw != 0)
            })
            .transpose()?;

        let effective = CaptureConfig {
            region: Region {
                x,
                y,
                size: RegionSize::Explicit(confirmed.size),
            },
            binning: confirmed.binning,
            pixel_format: confirmed.format,
            gain,
            exposure_us,
            target_temperature_c,
            cooler_enabled,
            hardware_binning,
            offset,
            usb_bandwidth,
            high_speed_mode,
        };

        info!(
            "Configured {}: region {} bin {} {} gain {} exposure {} us",
            handle,
            effective.region,
            effective.binning,
            effective.pixel_format,
            effective.gain,
            effective.exposure_us
        );
        Ok(effective)
    }
}

/// Resolve and validate the readout size for `desired` against `caps`.
fn resolve_region(caps: &CapabilityInfo, desired: &CaptureConfig) -> Result<ImageSize, CaptureError> {
    let binning = desired.binning;
    if binning == 0 || !caps.supported_bins.contains(&binning) {
        return Err(CaptureError::config(
            "binning",
            binning,
            format!("supported bins are {:?}", caps.supported_bins),
        ));
    }
    if !caps.supported_formats.contains(&desired.pixel_format) {
        return Err(CaptureError::config(
            "pixel_format",
            desired.pixel_format,
            format!("supported formats are {:?}", caps.supported_formats),
        ));
    }

    let size = match desired.region.size {
        RegionSize::FullFrame => {
            ImageSize::aligned_full_frame(caps.max_size(), binning, caps.roi_alignment)
        }
        RegionSize::Explicit(size) => {
            if size.width == 0 || size.height == 0 {
                return Err(CaptureError::config("region", size, "zero-sized region"));
            }
            if !size.is_aligned(caps.roi_alignment) {
                return Err(CaptureError::config(
                    "region",
                    size,
                    format!(
                        "dimensions must be multiples of {} pixels",
                        caps.roi_alignment
                    ),
                ));
            }
            size
        }
    };

    let binned_width = caps.max_width / binning;
    let binned_height = caps.max_height / binning;
    let region = desired.region;
    if !span_fits(region.x, size.width, binned_width)
        || !span_fits(region.y, size.height, binned_height)
    {
        return Err(CaptureError::config(
            "region",
            format!("{size}@({}, {})", region.x, region.y),
            format!("exceeds binned sensor {binned_width}x{binned_height}"),
        ));
    }

    Ok(size)
}

/// `start + extent <= limit`, false on overflow
fn span_fits(start: u32, extent: u32, limit: u32) -> bool {
    start.checked_add(extent).is_some_and(|end| end <= limit)
}

/// Write one scalar control and return the device-confirmed value.
fn apply_control<D: SensorDriver + ?Sized>(
    driver: &mut D,
    handle: DeviceHandle,
    caps: &CapabilityInfo,
    kind: ControlKind,
    requested: i64,
) -> Result<i64, CaptureError> {
    let control_caps = caps
        .control(kind)
        .ok_or_else(|| CaptureError::config(kind.name(), requested, "not supported by device"))?;
    if !control_caps.writable || !kind.is_host_writable() {
        return Err(CaptureError::config(kind.name(), requested, "control is read only"));
    }
    if !control_caps.contains(requested) {
        return Err(CaptureError::config(
            kind.name(),
            requested,
            format!(
                "outside device range {}..={}",
                control_caps.min, control_caps.max
            ),
        ));
    }

    driver
        .set_control(handle, kind, requested)
        .map_err(|e| device_failure(kind.name(), requested, e))?;
    let confirmed = driver
        .get_control(handle, kind)
        .map_err(|e| CaptureError::fatal(format!("{kind} read-back"), e))?;
    let confirmed = check_physical(kind, confirmed)?;

    if confirmed != requested {
        warn!("{} requested {} but device reports {}", kind, requested, confirmed);
    } else {
        debug!("{} = {}", kind, confirmed);
    }
    Ok(confirmed)
}
