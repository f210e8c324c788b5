//! Frame acquisition pipeline.
//!
//! Configuration ([`control`]), the polling loop ([`capture_loop`]), exposure
//! timing reconstruction ([`timestamps`]) and run accounting ([`metrics`]).
//! Frames leave the pipeline through a
//! [`WriteBackSink`](crate::frame_writer::writeback::WriteBackSink).

pub mod capture_loop;
pub mod config;
pub mod control;
pub mod metrics;
pub mod timestamps;

pub use capture_loop::{CaptureLoop, CaptureState, LoopSettings};
pub use config::{CaptureConfig, Region, RegionSize};
pub use control::{open_camera, ControlManager};
pub use metrics::RunMetrics;
pub use timestamps::{ExposureWindow, TimestampChain, TimestampPolicy};

use crate::camera_interface::{ControlKind, DeviceError};
use std::fmt::Display;
use thiserror::Error;

/// Errors that end a configuration attempt or a capture run
#[derive(Error, Debug)]
pub enum CaptureError {
    /// A requested parameter is invalid for this device, or the device refused it.
    ///
    /// The device may be left partially configured.
    #[error("configuration error: {parameter}={requested}: {reason}")]
    Configuration {
        parameter: String,
        requested: String,
        reason: String,
    },

    /// The device can no longer be used for this run
    #[error("fatal device error during {context}: {source}")]
    FatalDevice {
        context: String,
        #[source]
        source: DeviceError,
    },

    /// A read-back landed outside the control's physical envelope
    #[error("{control} read back {value}, outside physical range {min}..={max}")]
    ReadbackOutOfRange {
        control: ControlKind,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Pipeline-level failure not tied to a device call
    #[error("capture error: {0}")]
    Capture(String),
}

impl CaptureError {
    pub fn config(
        parameter: impl Into<String>,
        requested: impl Display,
        reason: impl Into<String>,
    ) -> Self {
        CaptureError::Configuration {
            parameter: parameter.into(),
            requested: requested.to_string(),
            reason: reason.into(),
        }
    }

    pub fn fatal(context: impl Into<String>, source: DeviceError) -> Self {
        CaptureError::FatalDevice {
            context: context.into(),
            source,
        }
    }

    /// Configuration problems leave the device usable; everything else does not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CaptureError::Configuration { .. })
    }
}

/// Verify a read-back against the control's physical envelope.
pub(crate) fn check_physical(control: ControlKind, value: i64) -> Result<i64, CaptureError> {
    let range = control.physical_range();
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(CaptureError::ReadbackOutOfRange {
            control,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}
