//! Declarative acquisition parameters

use crate::camera_interface::PixelFormat;
use crate::image_size::ImageSize;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Requested readout size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSize {
    /// Largest alignment-safe readout for the chosen binning
    FullFrame,
    /// Exact crop dimensions in binned pixels, used without correction
    Explicit(ImageSize),
}

/// Readout region: start offset plus size, in binned pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RegionRepr", into = "RegionRepr")]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub size: RegionSize,
}

impl Region {
    pub fn full_frame() -> Self {
        Self {
            x: 0,
            y: 0,
            size: RegionSize::FullFrame,
        }
    }

    pub fn explicit(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            size: RegionSize::Explicit(ImageSize::from_width_height(width, height)),
        }
    }

    /// Concrete dimensions, if already resolved
    pub fn dimensions(&self) -> Option<ImageSize> {
        match self.size {
            RegionSize::Explicit(size) => Some(size),
            RegionSize::FullFrame => None,
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::full_frame()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.size {
            RegionSize::FullFrame => write!(f, "full-frame@({}, {})", self.x, self.y),
            RegionSize::Explicit(size) => write!(f, "{size}@({}, {})", self.x, self.y),
        }
    }
}

/// On-disk form: omitting width and height requests a full-frame readout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegionRepr {
    #[serde(default)]
    x: u32,
    #[serde(default)]
    y: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
}

impl TryFrom<RegionRepr> for Region {
    type Error = String;

    fn try_from(repr: RegionRepr) -> Result<Self, Self::Error> {
        let size = match (repr.width, repr.height) {
            (None, None) => RegionSize::FullFrame,
            (Some(width), Some(height)) => {
                RegionSize::Explicit(ImageSize::from_width_height(width, height))
            }
            _ => return Err("region width and height must be given together".to_string()),
        };
        Ok(Region {
            x: repr.x,
            y: repr.y,
            size,
        })
    }
}

impl From<Region> for RegionRepr {
    fn from(region: Region) -> Self {
        let (width, height) = match region.size {
            RegionSize::FullFrame => (None, None),
            RegionSize::Explicit(size) => (Some(size.width), Some(size.height)),
        };
        RegionRepr {
            x: region.x,
            y: region.y,
            width,
            height,
        }
    }
}

/// Acquisition parameters, either as requested or as confirmed by the device.
///
/// Once returned from [`ControlManager::configure`](super::ControlManager::configure)
/// the region always carries explicit dimensions and every scalar is the value
/// the device reported back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub region: Region,
    pub binning: u32,
    pub pixel_format: PixelFormat,
    pub gain: i64,
    pub exposure_us: u64,
    pub target_temperature_c: f64,
    pub cooler_enabled: bool,
    pub hardware_binning: bool,
    /// Black level offset; left at the device default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// USB bandwidth percentage; left at the device default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_bandwidth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_speed_mode: Option<bool>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            region: Region::full_frame(),
            binning: 1,
            pixel_format: PixelFormat::Raw16,
            gain: 0,
            exposure_us: 10_000,
            target_temperature_c: 0.0,
            cooler_enabled: false,
            hardware_binning: false,
            offset: None,
            usb_bandwidth: None,
            high_speed_mode: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_yaml_full_frame() {
        let region: Region = serde_yaml::from_str("x: 0\ny: 0\n").unwrap();
        assert_eq!(region, Region::full_frame());
    }

    #[test]
    fn test_region_yaml_explicit() {
        let region: Region = serde_yaml::from_str("x: 16\ny: 8\nwidth: 400\nheight: 400\n").unwrap();
        assert_eq!(region, Region::explicit(16, 8, 400, 400));

        let yaml = serde_yaml::to_string(&region).unwrap();
        let back: Region = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, region);
    }

    #[test]
    fn test_region_requires_both_dimensions() {
        let result: Result<Region, _> = serde_yaml::from_str("width: 400\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_capture_config_defaults_fill_missing_fields() {
        let config: CaptureConfig =
            serde_yaml::from_str("binning: 2\nexposure_us: 20000\npixel_format: RAW8\n").unwrap();
        assert_eq!(config.binning, 2);
        assert_eq!(config.exposure_us, 20_000);
        assert_eq!(config.pixel_format, PixelFormat::Raw8);
        assert_eq!(config.region, Region::full_frame());
        assert!(!config.cooler_enabled);
        assert_eq!(config.offset, None);
    }
}
