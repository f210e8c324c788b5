//! Exposure timing reconstruction.
//!
//! The driver reports no per-frame timestamps, so exposure windows are
//! reconstructed by chaining: each frame starts where the previous one ended
//! and lasts exactly the configured exposure. The chain is anchored to the
//! wall-clock instant the run started. Arithmetic stays in whole microseconds;
//! rounding to milliseconds only happens when formatting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// ISO-8601 layout used for `DATE-OBS` / `DATE-END`, truncated to milliseconds
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// How the chain reacts to frames the driver dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    /// Never resynchronise; dropped frames compress the timeline
    #[default]
    Chained,
    /// Advance the chain by one exposure per driver-reported drop.
    ///
    /// Produces different timestamps than `Chained` for the same run whenever
    /// frames were dropped.
    ResyncOnDrop,
}

impl fmt::Display for TimestampPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimestampPolicy::Chained => f.write_str("chained"),
            TimestampPolicy::ResyncOnDrop => f.write_str("resync-on-drop"),
        }
    }
}

/// Reconstructed exposure interval of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ExposureWindow {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn start_iso(&self) -> String {
        self.start.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn end_iso(&self) -> String {
        self.end.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Chained exposure-window generator
#[derive(Debug, Clone)]
pub struct TimestampChain {
    run_start: DateTime<Utc>,
    exposure_us: i64,
    /// End of the previous window, microseconds after `run_start`
    previous_end_us: i64,
}

impl TimestampChain {
    pub fn new(run_start: DateTime<Utc>, exposure_us: u64) -> Self {
        Self {
            run_start,
            exposure_us: i64::try_from(exposure_us).unwrap_or(i64::MAX),
            previous_end_us: 0,
        }
    }

    pub fn run_start(&self) -> DateTime<Utc> {
        self.run_start
    }

    /// Window for the next delivered frame
    pub fn next_window(&mut self) -> ExposureWindow {
        let start_us = self.previous_end_us;
        let end_us = start_us.saturating_add(self.exposure_us);
        self.previous_end_us = end_us;
        ExposureWindow {
            start: self.run_start + Duration::microseconds(start_us),
            end: self.run_start + Duration::microseconds(end_us),
        }
    }

    /// Account for `frames` exposures that were never delivered
    pub fn skip(&mut self, frames: u64) {
        let frames = i64::try_from(frames).unwrap_or(i64::MAX);
        self.previous_end_us = self
            .previous_end_us
            .saturating_add(frames.saturating_mul(self.exposure_us));
    }
}
