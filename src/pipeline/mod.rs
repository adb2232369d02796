pub mod retention;
pub mod timing;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::capture::Frame;

pub use retention::RetentionBuffer;
pub use timing::FrameTimingEstimator;

/// A frame together with the moment the recorder took it in.
///
/// Immutable once created. Cloning shares the pixel payload, which is never
/// written after capture, so a clone is an independent record.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub frame: Frame,
    pub ingested_at: Instant,
    pub wall_clock: DateTime<Utc>,
}

impl FrameRecord {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            ingested_at: Instant::now(),
            wall_clock: Utc::now(),
        }
    }
}
