//! Sensor driver abstraction for the acquisition pipeline
//!
//! The vendor SDK is an external collaborator; this module only fixes the
//! interface it has to expose. [`mock::MockSensor`] implements it in-process
//! for tests and for running the pipeline without hardware.

pub mod controls;
pub mod mock;

pub use controls::{ControlCaps, ControlKind, ControlUnit};

use crate::image_size::ImageSize;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Enumeration index of a connected camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub i32);

/// Opaque identifier for an opened, initialized sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "camera#{}", self.0)
    }
}

/// Pixel layout delivered by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// 8-bit raw bayer or mono
    Raw8,
    /// 8-bit per channel BGR
    Rgb24,
    /// 16-bit little-endian raw
    Raw16,
    /// 8-bit luminance
    Y8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Raw8 | PixelFormat::Y8 => 1,
            PixelFormat::Raw16 => 2,
            PixelFormat::Rgb24 => 3,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PixelFormat::Raw8 => "RAW8",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Raw16 => "RAW16",
            PixelFormat::Y8 => "Y8",
        };
        f.write_str(name)
    }
}

/// Region, binning and format as one device-level setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFormat {
    pub size: ImageSize,
    pub binning: u32,
    pub format: PixelFormat,
}

/// Outcome of a single bounded frame poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// A complete frame
    Frame(Vec<u8>),
    /// Nothing arrived before the poll timeout
    Timeout,
    /// The driver returned without data and without timing out
    Empty,
}

/// Static capability metadata reported by the device
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityInfo {
    /// Camera model name
    pub name: String,
    /// Full sensor width in unbinned pixels
    pub max_width: u32,
    /// Full sensor height in unbinned pixels
    pub max_height: u32,
    /// Physical pixel pitch in microns
    pub pixel_size_um: f64,
    pub supported_bins: Vec<u32>,
    pub supported_formats: Vec<PixelFormat>,
    /// ROI width and height must be multiples of this
    pub roi_alignment: u32,
    pub has_cooler: bool,
    pub is_color: bool,
    /// ADC bit depth
    pub bit_depth: u8,
    pub controls: BTreeMap<ControlKind, ControlCaps>,
}

impl CapabilityInfo {
    /// Full sensor dimensions as an [`ImageSize`]
    pub fn max_size(&self) -> ImageSize {
        ImageSize::from_width_height(self.max_width, self.max_height)
    }

    pub fn control(&self, kind: ControlKind) -> Option<&ControlCaps> {
        self.controls.get(&kind)
    }
}

/// Errors reported by the sensor driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The handle does not refer to an open camera
    #[error("invalid device handle")]
    InvalidHandle,

    /// The camera disappeared from the bus
    #[error("camera removed")]
    CameraRemoved,

    /// No camera matches the requested identifier
    #[error("camera not found: {0}")]
    NotFound(String),

    /// The device refused a setting
    #[error("device rejected {control}: {reason}")]
    Rejected { control: String, reason: String },

    /// Transfer or protocol failure
    #[error("communication error: {0}")]
    Communication(String),

    /// Operation not valid in the current device state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl DeviceError {
    /// Errors after which the handle can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::InvalidHandle | DeviceError::CameraRemoved)
    }
}

/// Result type for driver operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Operations the pipeline requires from a sensor driver.
///
/// The driver is not assumed to be re-entrant: all calls for one handle are
/// made sequentially from the capture thread.
pub trait SensorDriver {
    /// Version string of the underlying SDK
    fn sdk_version(&self) -> String;

    /// Connected cameras keyed by serial number
    fn enumerate(&mut self) -> DeviceResult<HashMap<String, CameraId>>;

    fn open(&mut self, id: CameraId) -> DeviceResult<DeviceHandle>;

    fn init(&mut self, handle: DeviceHandle) -> DeviceResult<()>;

    fn close(&mut self, handle: DeviceHandle) -> DeviceResult<()>;

    fn get_capability(&mut self, handle: DeviceHandle) -> DeviceResult<CapabilityInfo>;

    fn get_control(&mut self, handle: DeviceHandle, control: ControlKind) -> DeviceResult<i64>;

    fn set_control(
        &mut self,
        handle: DeviceHandle,
        control: ControlKind,
        value: i64,
    ) -> DeviceResult<()>;

    /// Set readout size, binning and format in one call.
    ///
    /// The device does not support changing one of these without the others.
    fn set_region(
        &mut self,
        handle: DeviceHandle,
        size: ImageSize,
        binning: u32,
        format: PixelFormat,
    ) -> DeviceResult<()>;

    fn get_region(&mut self, handle: DeviceHandle) -> DeviceResult<RegionFormat>;

    /// Set the region start position. Must follow [`SensorDriver::set_region`].
    fn set_offset(&mut self, handle: DeviceHandle, x: u32, y: u32) -> DeviceResult<()>;

    fn get_offset(&mut self, handle: DeviceHandle) -> DeviceResult<(u32, u32)>;

    fn start_capture(&mut self, handle: DeviceHandle) -> DeviceResult<()>;

    fn stop_capture(&mut self, handle: DeviceHandle) -> DeviceResult<()>;

    /// Wait up to `timeout_ms` for the next frame
    fn poll_frame(
        &mut self,
        handle: DeviceHandle,
        size: ImageSize,
        format: PixelFormat,
        timeout_ms: u32,
    ) -> DeviceResult<Polled>;

    /// Frames the driver discarded since capture started
    fn get_dropped_frame_count(&mut self, handle: DeviceHandle) -> DeviceResult<u64>;
}
