//! Monitor configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! stock 480x320 at 32 fps, hourly-rotation setup.

use crate::traits::{CameraError, FourCC, Resolution, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Capture device settings.
    pub camera: CameraConfig,
    /// Recording and finalization settings.
    pub recording: RecordingConfig,
}

/// Capture device settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    /// Device index (`/dev/videoN`).
    pub device: usize,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    pub frame_rate: u32,
    /// Pixel format code, e.g. `H264`.
    pub pixel_format: String,
    /// Seconds before a started stream reports itself as running.
    pub warmup_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: 0,
            width: 480,
            height: 320,
            frame_rate: 32,
            pixel_format: "H264".to_owned(),
            warmup_secs: 3,
        }
    }
}

/// Recording and finalization settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    /// Directory receiving segment files.
    pub output_dir: PathBuf,
    /// Segment rotation interval in seconds.
    pub interval_secs: u64,
    /// Container tool invoked for each closed segment.
    pub mp4box: PathBuf,
    /// Finalizer worker threads.
    pub finalize_workers: usize,
    /// Closed segments that may wait for a worker.
    pub finalize_queue: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            interval_secs: 3600,
            mp4box: PathBuf::from("MP4Box"),
            finalize_workers: 2,
            finalize_queue: 8,
        }
    }
}

impl MonitorConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            CameraError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&contents)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| CameraError::Config(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CameraError::Config(msg.to_owned()));
        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("resolution must be non-zero");
        }
        if self.camera.frame_rate == 0 || self.camera.frame_rate > 240 {
            return invalid("frame rate must be 1-240");
        }
        FourCC::parse(&self.camera.pixel_format)?;
        if self.recording.interval_secs == 0 {
            return invalid("rotation interval must be non-zero");
        }
        if self.recording.finalize_workers == 0 {
            return invalid("at least one finalize worker is required");
        }
        if self.recording.finalize_queue == 0 {
            return invalid("finalize queue capacity must be non-zero");
        }
        Ok(())
    }

    /// Requested capture resolution.
    pub const fn resolution(&self) -> Resolution {
        Resolution::new(self.camera.width, self.camera.height)
    }

    /// Requested pixel format.
    pub fn fourcc(&self) -> Result<FourCC> {
        FourCC::parse(&self.camera.pixel_format)
    }

    /// Default rotation interval.
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.recording.interval_secs)
    }

    /// Stream warm-up period.
    pub const fn warmup(&self) -> Duration {
        Duration::from_secs(self.camera.warmup_secs)
    }
}
