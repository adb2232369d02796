use chrono::{DateTime, Utc};
use serde::Serialize;

use super::CapturePhase;

/// Point-in-time view of the recorder for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub retained_frame_count: usize,
    pub retained_duration_seconds: f64,
    pub buffer_capacity: usize,
    pub evicted_frames: u64,
    pub is_capturing: bool,
    pub phase: CapturePhase,
    pub active_trigger: Option<DateTime<Utc>>,
    pub effective_rate_estimate: f64,
    pub configured_default_rate: f64,
    pub timing_samples: usize,
}
