//! Event-triggered video black box.
//!
//! Keeps a rolling window of recent camera frames and, when a collision
//! signal arrives, writes the frames before and after it into one video.

pub mod capture;
mod error;
pub mod pipeline;
pub mod recorder;
pub mod sink;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{Error, Result};
pub use pipeline::FrameRecord;
pub use recorder::{AccidentRecorder, CaptureOutcome, CaptureReport, RecorderStatus};
pub use sink::{PersistenceSink, VideoFileSink};
pub use source::{CollisionReading, CollisionSource, FrameSource, Latest};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "BLACKBOX";

/// Highest frame rate accepted anywhere in the configuration
pub const MAX_RATE: f64 = 1000.0;
/// Longest pre- or post-event window accepted
pub const MAX_WINDOW_SECS: f64 = 3600.0;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub recorder: RecorderConfig,
    pub output: OutputConfig,
    pub signals: SignalConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    V4l2,
    TestPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Device path; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Interval stretch applied by the test pattern, as a fraction of 1/fps
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Seed for the rate estimate and cadence of post-event pulls
    pub default_fps: f64,
    /// Ceiling on the rate used to size the retention buffer
    pub max_fps: f64,
    pub pre_event_secs: f64,
    pub post_event_secs: f64,
    /// Arrival timestamps kept by the timing estimator
    pub timing_history: usize,
    /// Most recent arrivals averaged per rate update
    pub rate_window: usize,
    /// EWMA weight of the newest instantaneous rate
    pub smoothing: f64,
    /// Capacity change, in frames, below which the buffer is not rebuilt
    pub resize_hysteresis: usize,
    /// Period of the ingestion loop; repeated polls of one frame are ignored,
    /// so this only bounds the arrival-time error
    pub cycle_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Readings older than this are treated as absent
    pub freshness_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::TestPattern,
            device: String::new(),
            width: 640,
            height: 360,
            fps: 30.0,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            jitter: 0.0,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            default_fps: 30.0,
            max_fps: 120.0,
            pre_event_secs: 15.0,
            post_event_secs: 15.0,
            timing_history: 100,
            rate_window: 30,
            smoothing: 0.2,
            resize_hysteresis: 5,
            cycle_interval_ms: 10,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("accident_recordings"),
            file_prefix: "accident".into(),
            width: 640,
            height: 360,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self { freshness_ms: 2000 }
    }
}

impl RecorderConfig {
    pub fn pre_event(&self) -> Duration {
        Duration::from_secs_f64(self.pre_event_secs)
    }

    pub fn post_event(&self) -> Duration {
        Duration::from_secs_f64(self.post_event_secs)
    }

    /// Fixed spacing of post-event pulls
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.default_fps)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(1))
    }
}

impl SignalConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `BLACKBOX__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.recorder;
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{name} must be positive, got {v}")))
            }
        };
        let bounded = |name: &str, v: f64, max: f64| {
            positive(name, v)?;
            if v <= max {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{name} must be at most {max}, got {v}")))
            }
        };
        bounded("recorder.default_fps", r.default_fps, MAX_RATE)?;
        bounded("recorder.max_fps", r.max_fps, MAX_RATE)?;
        bounded("recorder.pre_event_secs", r.pre_event_secs, MAX_WINDOW_SECS)?;
        bounded("recorder.post_event_secs", r.post_event_secs, MAX_WINDOW_SECS)?;
        bounded("capture.fps", self.capture.fps, MAX_RATE)?;
        if r.max_fps < r.default_fps {
            return Err(Error::InvalidConfig(format!(
                "recorder.max_fps ({}) is below recorder.default_fps ({})",
                r.max_fps, r.default_fps
            )));
        }
        if r.cycle_interval_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "recorder.cycle_interval_ms must be at most 60000, got {}",
                r.cycle_interval_ms
            )));
        }

        if r.timing_history < 2 || r.rate_window < 2 {
            return Err(Error::InvalidConfig(
                "recorder.timing_history and recorder.rate_window need at least 2 samples".into(),
            ));
        }
        if !(r.smoothing > 0.0 && r.smoothing <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "recorder.smoothing must be in (0, 1], got {}",
                r.smoothing
            )));
        }
        let (w, h) = (self.output.width, self.output.height);
        if w == 0 || h == 0 || w > u32::from(u16::MAX) || h > u32::from(u16::MAX) {
            return Err(Error::InvalidConfig(format!(
                "output resolution {w}x{h} must be non-zero and fit an MP4 track"
            )));
        }
        Ok(())
    }
}
