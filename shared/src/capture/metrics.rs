//! Run accounting.

use crate::frame_writer::WriteStats;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Counters and timings for one capture run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    pub frames_requested: u64,
    pub poll_attempts: u64,
    /// Successful polls handed to the write-back sink
    pub frames_captured: u64,
    pub frames_written: u64,
    pub write_failures: u64,
    /// Frames the sink refused because its queue was full
    pub frames_rejected: u64,
    pub poll_timeouts: u64,
    pub empty_reads: u64,
    /// Driver-side drop counter at the end of the run
    pub frames_dropped: u64,
    pub elapsed_acquisition: Duration,
    pub elapsed_writeback: Duration,
    pub last_written_path: Option<PathBuf>,
    pub last_written_sequence: Option<u64>,
}

impl RunMetrics {
    pub fn new(frames_requested: u64) -> Self {
        Self {
            frames_requested,
            ..Self::default()
        }
    }

    /// Fold in the write-side counters collected after the shutdown barrier
    pub fn merge_write_stats(&mut self, stats: WriteStats) {
        self.frames_written = stats.frames_written;
        self.write_failures = stats.write_failures;
        self.frames_rejected = stats.frames_rejected;
        self.elapsed_writeback = stats.elapsed_writeback;
        self.last_written_path = stats.last_written_path;
        self.last_written_sequence = stats.last_written_sequence;
    }

    /// Acquisition rate over the capture phase
    pub fn frames_per_second(&self) -> f64 {
        let secs = self.elapsed_acquisition.as_secs_f64();
        if secs > 0.0 {
            self.frames_captured as f64 / secs
        } else {
            0.0
        }
    }

    /// Frames that were captured but never reached disk
    pub fn frames_lost(&self) -> u64 {
        self.frames_captured
            .saturating_sub(self.frames_written)
    }
}

impl fmt::Display for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Captured {}/{} frames in {:.3} s ({:.1} fps)",
            self.frames_captured,
            self.frames_requested,
            self.elapsed_acquisition.as_secs_f64(),
            self.frames_per_second()
        )?;
        writeln!(
            f,
            "  polls: {} ({} timeouts, {} empty reads)",
            self.poll_attempts, self.poll_timeouts, self.empty_reads
        )?;
        writeln!(f, "  driver drops: {}", self.frames_dropped)?;
        write!(
            f,
            "  written: {} ({} failed, {} rejected) in {:.3} s",
            self.frames_written,
            self.write_failures,
            self.frames_rejected,
            self.elapsed_writeback.as_secs_f64()
        )?;
        if let Some(path) = &self.last_written_path {
            write!(f, "\n  last frame: {}", path.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frames_per_second() {
        let metrics = RunMetrics {
            frames_captured: 50,
            elapsed_acquisition: Duration::from_millis(500),
            ..RunMetrics::new(50)
        };
        assert_relative_eq!(metrics.frames_per_second(), 100.0);
        assert_eq!(RunMetrics::new(10).frames_per_second(), 0.0);
    }

    #[test]
    fn test_merge_write_stats() {
        let mut metrics = RunMetrics {
            frames_captured: 5,
            ..RunMetrics::new(5)
        };
        metrics.merge_write_stats(WriteStats {
            frames_written: 4,
            write_failures: 1,
            last_written_sequence: Some(4),
            last_written_path: Some(PathBuf::from("out/frame000004.fits")),
            ..WriteStats::default()
        });
        assert_eq!(metrics.frames_written, 4);
        assert_eq!(metrics.frames_lost(), 1);
        assert!(metrics.to_string().contains("frame000004.fits"));
    }

    #[test]
    fn test_json_report() {
        let metrics = RunMetrics::new(20);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["frames_requested"], 20);
        assert!(json["last_written_path"].is_null());
    }
}
