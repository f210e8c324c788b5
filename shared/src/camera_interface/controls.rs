//! Named scalar sensor controls.
//!
//! The driver exposes a small, fixed vocabulary of integer-valued controls.
//! Each [`ControlKind`] knows its driver-facing name, its unit, whether the
//! host may write it, and the physical envelope a read-back must fall inside.
//! A value outside that envelope means the device link is broken, not that
//! the device clamped a request.

use std::fmt;
use std::ops::RangeInclusive;

/// Unit of a raw control value as exchanged with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlUnit {
    /// Dimensionless device units (gain steps, ADU offset)
    Raw,
    /// Microseconds
    Microseconds,
    /// Percent (0-100)
    Percent,
    /// Boolean flag encoded as 0 / 1
    Flag,
    /// Whole degrees Celsius
    Celsius,
    /// Tenths of a degree Celsius
    DeciCelsius,
}

/// Controls understood by the acquisition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlKind {
    /// Analog gain
    Gain,
    /// Exposure duration in microseconds
    Exposure,
    /// Black level offset
    Offset,
    /// USB bandwidth allocation
    BandwidthOverload,
    /// High speed readout mode
    HighSpeedMode,
    /// Bin on the sensor instead of in the driver
    HardwareBin,
    /// Thermo-electric cooler enable
    CoolerOn,
    /// Cooler set point
    TargetTemperature,
    /// Current sensor temperature (read only)
    SensorTemperature,
    /// Cooler drive level (read only)
    CoolerPowerPercent,
}

impl ControlKind {
    /// Every control, in the order the manager applies writable ones.
    pub const ALL: [ControlKind; 10] = [
        ControlKind::Gain,
        ControlKind::Exposure,
        ControlKind::Offset,
        ControlKind::BandwidthOverload,
        ControlKind::HighSpeedMode,
        ControlKind::HardwareBin,
        ControlKind::CoolerOn,
        ControlKind::TargetTemperature,
        ControlKind::SensorTemperature,
        ControlKind::CoolerPowerPercent,
    ];

    /// Name used by the vendor driver for this control
    pub fn name(&self) -> &'static str {
        match self {
            ControlKind::Gain => "Gain",
            ControlKind::Exposure => "Exposure",
            ControlKind::Offset => "Offset",
            ControlKind::BandwidthOverload => "BandWidth",
            ControlKind::HighSpeedMode => "HighSpeedMode",
            ControlKind::HardwareBin => "HardwareBin",
            ControlKind::CoolerOn => "CoolerOn",
            ControlKind::TargetTemperature => "TargetTemp",
            ControlKind::SensorTemperature => "Temperature",
            ControlKind::CoolerPowerPercent => "CoolPowerPerc",
        }
    }

    /// Look up a control by its driver name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn unit(&self) -> ControlUnit {
        match self {
            ControlKind::Gain | ControlKind::Offset => ControlUnit::Raw,
            ControlKind::Exposure => ControlUnit::Microseconds,
            ControlKind::BandwidthOverload | ControlKind::CoolerPowerPercent => {
                ControlUnit::Percent
            }
            ControlKind::HighSpeedMode | ControlKind::HardwareBin | ControlKind::CoolerOn => {
                ControlUnit::Flag
            }
            ControlKind::TargetTemperature => ControlUnit::Celsius,
            ControlKind::SensorTemperature => ControlUnit::DeciCelsius,
        }
    }

    /// Whether the host is ever allowed to write this control
    pub fn is_host_writable(&self) -> bool {
        !matches!(
            self,
            ControlKind::SensorTemperature | ControlKind::CoolerPowerPercent
        )
    }

    /// Envelope of physically meaningful raw values.
    pub fn physical_range(&self) -> RangeInclusive<i64> {
        match self {
            ControlKind::Gain => 0..=10_000,
            // 1 µs to 2000 s
            ControlKind::Exposure => 1..=2_000_000_000,
            ControlKind::Offset => 0..=65_535,
            ControlKind::BandwidthOverload | ControlKind::CoolerPowerPercent => 0..=100,
            ControlKind::HighSpeedMode | ControlKind::HardwareBin | ControlKind::CoolerOn => 0..=1,
            ControlKind::TargetTemperature => -80..=60,
            ControlKind::SensorTemperature => -1_000..=1_000,
        }
    }

    /// Convert a raw value to degrees Celsius for temperature controls.
    pub fn raw_to_celsius(&self, raw: i64) -> Option<f64> {
        match self.unit() {
            ControlUnit::Celsius => Some(raw as f64),
            ControlUnit::DeciCelsius => Some(raw as f64 / 10.0),
            _ => None,
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device-reported capability of a single control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCaps {
    pub min: i64,
    pub max: i64,
    pub default: i64,
    /// The device accepts writes to this control
    pub writable: bool,
}

impl ControlCaps {
    pub fn new(min: i64, max: i64, default: i64, writable: bool) -> Self {
        Self {
            min,
            max,
            default,
            writable,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// Clamp a value into the reported range
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in ControlKind::ALL {
            assert_eq!(ControlKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ControlKind::from_name("WB_R"), None);
    }

    #[test]
    fn test_temperature_conversion() {
        assert_eq!(
            ControlKind::SensorTemperature.raw_to_celsius(-153),
            Some(-15.3)
        );
        assert_eq!(ControlKind::TargetTemperature.raw_to_celsius(-10), Some(-10.0));
        assert_eq!(ControlKind::Gain.raw_to_celsius(100), None);
    }

    #[test]
    fn test_read_only_controls() {
        assert!(!ControlKind::SensorTemperature.is_host_writable());
        assert!(!ControlKind::CoolerPowerPercent.is_host_writable());
        assert!(ControlKind::Exposure.is_host_writable());
    }

    #[test]
    fn test_caps_clamp() {
        let caps = ControlCaps::new(0, 570, 200, true);
        assert!(caps.contains(570));
        assert!(!caps.contains(571));
        assert_eq!(caps.clamp(1000), 570);
        assert_eq!(caps.clamp(-3), 0);
    }
}
