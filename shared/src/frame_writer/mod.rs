//! Frame persistence: header contract, file naming and write-back.
//!
//! A [`FrameRecord`] leaves the capture loop together with its
//! [`FrameHeader`] and is handed to a [`writeback::WriteBackSink`], which
//! calls a [`FrameEncoder`] either inline or on a worker pool.

#[cfg(feature = "frame-writer")]
pub mod fits;
pub mod writeback;

#[cfg(feature = "frame-writer")]
pub use fits::FitsEncoder;
pub use writeback::{PoolConfig, SaturationPolicy, Submission, WriteBackSink, WriteStats};

use crate::camera_interface::PixelFormat;
use crate::capture::ExposureWindow;
use crate::image_size::ImageSize;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File names carry six sequence digits
pub const MAX_SEQUENCE: u64 = 999_999;

/// Errors raised while persisting a frame
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} already exists and overwrite is disabled", .0.display())]
    AlreadyExists(PathBuf),

    #[error("sequence {0} does not fit the six digit file name")]
    SequenceOverflow(u64),

    #[error("pixel buffer holds {actual} bytes, {expected} expected")]
    BufferLength { expected: usize, actual: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("encoder error: {0}")]
    Encoder(String),
}

/// Tile compression applied by the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Rice,
    Gzip,
    Plio,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Rice => "rice",
            Compression::Gzip => "gzip",
            Compression::Plio => "plio",
        };
        f.write_str(name)
    }
}

/// One header value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::Str(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(value as i64)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

/// Ordered header keyword mapping.
///
/// Keywords are written in insertion order; inserting an existing keyword
/// replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameHeader {
    cards: Vec<(String, HeaderValue)>,
}

impl FrameHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<HeaderValue>) {
        let value = value.into();
        match self.cards.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.cards.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// A captured frame, owned by the write-back path once submitted
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Zero-based index among delivered frames
    pub sequence: u64,
    pub size: ImageSize,
    pub pixel_format: PixelFormat,
    pub pixel_buffer: Vec<u8>,
    pub window: ExposureWindow,
    /// Absent when the temperature read failed
    pub sensor_temperature_c: Option<f64>,
    pub start_x: u32,
    pub start_y: u32,
    pub binning: u32,
    pub gain: i64,
    pub exposure_us: u64,
}

impl FrameRecord {
    /// Check the buffer length against size and format
    pub fn validate(&self) -> Result<(), WriteError> {
        let expected = self.size.buffer_len(self.pixel_format);
        if self.pixel_buffer.len() != expected {
            return Err(WriteError::BufferLength {
                expected,
                actual: self.pixel_buffer.len(),
            });
        }
        Ok(())
    }
}

/// Run-level values that go into every header
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderContext {
    pub instrument: String,
    /// Unbinned pixel pitch in microns
    pub pixel_size_um: f64,
    /// Cooler set point, only when the cooler is enabled
    pub target_temperature_c: Option<f64>,
}

/// Build the header for one frame.
///
/// Keyword order: FRAMENUM, EXPOSURE, EXPOUS, XORGSUBF, YORGSUBF, XBINNING,
/// YBINNING, GAIN, INSTRUME, XPIXSZ, YPIXSZ, CCD-TEMP, SET-TEMP, DATE-OBS,
/// DATE-END. CCD-TEMP and SET-TEMP are left out when unknown.
pub fn build_header(record: &FrameRecord, context: &HeaderContext) -> FrameHeader {
    let mut header = FrameHeader::new();
    let binned_pixel_um = context.pixel_size_um * record.binning as f64;

    header.insert("FRAMENUM", record.sequence as i64);
    header.insert("EXPOSURE", record.exposure_us as f64 / 1e6);
    header.insert("EXPOUS", record.exposure_us as i64);
    header.insert("XORGSUBF", record.start_x);
    header.insert("YORGSUBF", record.start_y);
    header.insert("XBINNING", record.binning);
    header.insert("YBINNING", record.binning);
    header.insert("GAIN", record.gain);
    header.insert("INSTRUME", context.instrument.as_str());
    header.insert("XPIXSZ", binned_pixel_um);
    header.insert("YPIXSZ", binned_pixel_um);
    if let Some(temp) = record.sensor_temperature_c {
        header.insert("CCD-TEMP", temp);
    }
    if let Some(target) = context.target_temperature_c {
        header.insert("SET-TEMP", target);
    }
    header.insert("DATE-OBS", record.window.start_iso());
    header.insert("DATE-END", record.window.end_iso());
    header
}

/// File name for a sequence number: `frame{sequence:06}.{extension}`
pub fn frame_file_name(sequence: u64, extension: &str) -> Result<String, WriteError> {
    if sequence > MAX_SEQUENCE {
        return Err(WriteError::SequenceOverflow(sequence));
    }
    Ok(format!("frame{sequence:06}.{extension}"))
}

/// Output directory and write options shared by all frames of a run
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    pub directory: PathBuf,
    pub compression: Compression,
    pub overwrite: bool,
}

impl OutputLayout {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            compression: Compression::None,
            overwrite: false,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn path_for(&self, sequence: u64, extension: &str) -> Result<PathBuf, WriteError> {
        Ok(self.directory.join(frame_file_name(sequence, extension)?))
    }
}

/// Container encoder for one frame
pub trait FrameEncoder: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &str;

    fn write(
        &self,
        path: &Path,
        record: &FrameRecord,
        header: &FrameHeader,
        compression: Compression,
        overwrite: bool,
    ) -> Result<(), WriteError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::capture::TimestampChain;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every write instead of producing files
    #[derive(Debug, Default)]
    pub struct RecordingEncoder {
        pub written: Mutex<Vec<(PathBuf, FrameHeader)>>,
        pub fail_sequences: HashSet<u64>,
        pub delay: Option<Duration>,
    }

    impl RecordingEncoder {
        pub fn written_paths(&self) -> Vec<PathBuf> {
            let mut paths: Vec<_> = self
                .written
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect();
            paths.sort();
            paths
        }
    }

    pub fn sample_record() -> FrameRecord {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut chain = TimestampChain::new(start, 20_000);
        FrameRecord {
            sequence: 7,
            size: ImageSize::from_width_height(4, 2),
            pixel_format: PixelFormat::Raw16,
            pixel_buffer: vec![0; 16],
            window: chain.next_window(),
            sensor_temperature_c: Some(-9.8),
            start_x: 16,
            start_y: 8,
            binning: 2,
            gain: 120,
            exposure_us: 20_000,
        }
    }

    impl FrameEncoder for RecordingEncoder {
        fn extension(&self) -> &str {
            "fits"
        }

        fn write(
            &self,
            path: &Path,
            record: &FrameRecord,
            header: &FrameHeader,
            _compression: Compression,
            _overwrite: bool,
        ) -> Result<(), WriteError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail_sequences.contains(&record.sequence) {
                return Err(WriteError::Encoder("disk full".to_string()));
            }
            self.written
                .lock()
                .unwrap()
                .push((path.to_path_buf(), header.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_record;
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(frame_file_name(0, "fits").unwrap(), "frame000000.fits");
        assert_eq!(frame_file_name(42, "fits").unwrap(), "frame000042.fits");
        assert_eq!(frame_file_name(999_999, "fits").unwrap(), "frame999999.fits");
        assert!(matches!(
            frame_file_name(1_000_000, "fits"),
            Err(WriteError::SequenceOverflow(1_000_000))
        ));
    }

    #[test]
    fn test_header_order_and_values() {
        let context = HeaderContext {
            instrument: "ZWO ASI294MM Pro".to_string(),
            pixel_size_um: 4.63,
            target_temperature_c: Some(-10.0),
        };
        let header = build_header(&sample_record(), &context);

        let keys: Vec<_> = header.keys().collect();
        assert_eq!(
            keys,
            vec![
                "FRAMENUM", "EXPOSURE", "EXPOUS", "XORGSUBF", "YORGSUBF", "XBINNING", "YBINNING",
                "GAIN", "INSTRUME", "XPIXSZ", "YPIXSZ", "CCD-TEMP", "SET-TEMP", "DATE-OBS",
                "DATE-END",
            ]
        );
        assert_eq!(header.get("FRAMENUM"), Some(&HeaderValue::Int(7)));
        assert_eq!(header.get("EXPOSURE"), Some(&HeaderValue::Float(0.02)));
        assert_eq!(header.get("XBINNING"), Some(&HeaderValue::Int(2)));
        match header.get("XPIXSZ") {
            Some(HeaderValue::Float(v)) => approx::assert_relative_eq!(*v, 9.26),
            other => panic!("unexpected XPIXSZ {other:?}"),
        }
        assert_eq!(
            header.get("DATE-OBS"),
            Some(&HeaderValue::Str("2024-03-01T12:00:00.000".to_string()))
        );
        assert_eq!(
            header.get("DATE-END"),
            Some(&HeaderValue::Str("2024-03-01T12:00:00.020".to_string()))
        );
    }

    #[test]
    fn test_optional_temperature_keys() {
        let mut record = sample_record();
        record.sensor_temperature_c = None;
        let context = HeaderContext {
            instrument: "mock".to_string(),
            pixel_size_um: 2.9,
            target_temperature_c: None,
        };
        let header = build_header(&record, &context);
        assert!(header.get("CCD-TEMP").is_none());
        assert!(header.get("SET-TEMP").is_none());
        assert_eq!(header.len(), 13);
    }

    #[test]
    fn test_header_insert_replaces() {
        let mut header = FrameHeader::new();
        header.insert("GAIN", 1i64);
        header.insert("EXPOUS", 5i64);
        header.insert("GAIN", 2i64);
        assert_eq!(header.keys().collect::<Vec<_>>(), vec!["GAIN", "EXPOUS"]);
        assert_eq!(header.get("GAIN"), Some(&HeaderValue::Int(2)));
    }

    #[test]
    fn test_record_validation() {
        let mut record = sample_record();
        assert!(record.validate().is_ok());
        record.pixel_buffer.pop();
        assert!(matches!(
            record.validate(),
            Err(WriteError::BufferLength {
                expected: 16,
                actual: 15
            })
        ));
    }
}
