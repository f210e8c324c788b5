//! Run configuration files and named capture profiles.
//!
//! A [`RunConfig`] is a YAML document holding camera selection, acquisition
//! parameters, run options and write-back sizing. Named profiles are stored
//! in ~/.cf_config/capture_profiles/ by default.

use crate::capture::{CaptureConfig, TimestampPolicy};
use crate::frame_writer::{Compression, PoolConfig, SaturationPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which connected camera to use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSelection {
    /// Serial number; the first enumerated camera when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// Run length, output location and timing options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub frame_count: u64,
    pub poll_timeout_ms: u64,
    pub output_dir: PathBuf,
    pub compression: Compression,
    pub overwrite: bool,
    /// INSTRUME header value; the camera model name when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    pub timestamp_policy: TimestampPolicy,
}

impl RunSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            frame_count: 100,
            poll_timeout_ms: 500,
            output_dir: PathBuf::from("frames"),
            compression: Compression::None,
            overwrite: false,
            instrument: None,
            timestamp_policy: TimestampPolicy::Chained,
        }
    }
}

/// Where frames are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteBackMode {
    /// On the capture thread
    Synchronous,
    /// On a worker pool
    #[default]
    Detached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackConfig {
    pub mode: WriteBackMode,
    pub workers: usize,
    pub queue_depth: usize,
    pub when_full: SaturationPolicy,
}

impl WriteBackConfig {
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_depth: self.queue_depth,
            when_full: self.when_full,
        }
    }
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            mode: WriteBackMode::default(),
            workers: pool.workers,
            queue_depth: pool.queue_depth,
            when_full: pool.when_full,
        }
    }
}

/// Complete description of a capture run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub camera: CameraSelection,
    pub capture: CaptureConfig,
    pub run: RunSettings,
    pub writeback: WriteBackConfig,
}

impl RunConfig {
    /// Reject values no device could accept
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.binning == 0 {
            return Err(ConfigError::Invalid("binning must be at least 1".to_string()));
        }
        if self.capture.exposure_us == 0 {
            return Err(ConfigError::Invalid("exposure_us must be positive".to_string()));
        }
        if self.run.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be positive".to_string(),
            ));
        }
        if self.writeback.mode == WriteBackMode::Detached && self.writeback.workers == 0 {
            return Err(ConfigError::Invalid(
                "detached write-back needs at least one worker".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

/// Storage manager for named capture profiles.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.cf_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.cf_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".cf_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn profiles_dir(&self) -> PathBuf {
        self.root_path.join("capture_profiles")
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ConfigError::Invalid(format!("bad profile name {name:?}")));
        }
        Ok(self.profiles_dir().join(format!("{name}.yaml")))
    }

    /// Load a profile.
    ///
    /// Returns None if no profile of that name exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn get_profile(&self, name: &str) -> Option<Result<RunConfig, ConfigError>> {
        let path = match self.profile_path(name) {
            Ok(path) => path,
            Err(e) => return Some(Err(e)),
        };

        if !path.exists() {
            return None;
        }

        Some(RunConfig::load_from_file(&path))
    }

    /// Save a profile, creating the profiles directory if needed.
    pub fn save_profile(&self, name: &str, config: &RunConfig) -> Result<PathBuf, ConfigError> {
        let path = self.profile_path(name)?;
        config.validate()?;
        config.save_to_file(&path)?;
        Ok(path)
    }

    /// Names of all stored profiles, sorted
    pub fn list_profiles(&self) -> std::io::Result<Vec<String>> {
        let dir = self.profiles_dir();

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Returns Ok(true) if the profile was deleted, Ok(false) if it didn't exist.
    pub fn delete_profile(&self, name: &str) -> Result<bool, ConfigError> {
        let path = self.profile_path(name)?;

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".cf_config")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::PixelFormat;
    use crate::capture::Region;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
camera:
  serial: "1f2f190206070900"
capture:
  region: { x: 0, y: 0, width: 400, height: 400 }
  binning: 2
  pixel_format: RAW16
  gain: 120
  exposure_us: 20000
run:
  frame_count: 20
  output_dir: /data/run42
  compression: rice
writeback:
  mode: detached
  workers: 2
  when_full: drop
"#;

    #[test]
    fn test_parse_sample() {
        let config = RunConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.camera.serial.as_deref(), Some("1f2f190206070900"));
        assert_eq!(config.capture.region, Region::explicit(0, 0, 400, 400));
        assert_eq!(config.capture.pixel_format, PixelFormat::Raw16);
        assert_eq!(config.run.frame_count, 20);
        assert_eq!(config.run.compression, Compression::Rice);
        assert_eq!(config.run.poll_timeout(), Duration::from_millis(500));
        assert_eq!(config.writeback.pool().when_full, SaturationPolicy::Drop);
        assert_eq!(config.writeback.queue_depth, 16);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RunConfig::from_yaml("{}").unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_zero_exposure_rejected() {
        let result = RunConfig::from_yaml("capture:\n  exposure_us: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("run.yaml");
        let config = RunConfig::from_yaml(SAMPLE).unwrap();

        config.save_to_file(&path).unwrap();
        assert_eq!(RunConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_profiles() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        assert!(storage.list_profiles().unwrap().is_empty());
        assert!(storage.get_profile("darks").is_none());

        let config = RunConfig::from_yaml(SAMPLE).unwrap();
        let path = storage.save_profile("darks", &config).unwrap();
        assert!(path.ends_with("capture_profiles/darks.yaml"));
        storage.save_profile("flats", &RunConfig::default()).unwrap();

        assert_eq!(storage.list_profiles().unwrap(), vec!["darks", "flats"]);
        let loaded = storage.get_profile("darks").unwrap().unwrap();
        assert_eq!(loaded, config);

        assert!(storage.delete_profile("darks").unwrap());
        assert!(!storage.delete_profile("darks").unwrap());
    }

    #[test]
    fn test_profile_name_rejected() {
        let storage = ConfigStorage::with_path(PathBuf::from("/tmp/unused"));
        assert!(matches!(
            storage.save_profile("../escape", &RunConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
