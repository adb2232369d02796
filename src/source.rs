//! Pull-based collaborator interfaces consumed by the recorder.
//!
//! Producers (camera thread, sensor bridge, signal handler) publish into a
//! [`Latest`] slot; the recorder polls it. Absence of fresh data is reported
//! as `None`, never as an error.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::capture::Frame;

/// Gives the most recent camera frame, if one is fresh.
pub trait FrameSource: Send + Sync {
    fn poll_latest_frame(&self) -> Option<Frame>;
}

/// Gives the most recent collision-sensor reading, if one is fresh.
pub trait CollisionSource: Send + Sync {
    fn poll_collision_signal(&self) -> Option<CollisionReading>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionReading {
    pub active: bool,
    pub timestamp: DateTime<Utc>,
}

impl CollisionReading {
    pub fn now(active: bool) -> Self {
        Self {
            active,
            timestamp: Utc::now(),
        }
    }
}

struct Stamped<T> {
    value: T,
    published_at: Instant,
}

/// Lock-free latest-value slot with a freshness window.
pub struct Latest<T> {
    slot: ArcSwapOption<Stamped<T>>,
    freshness: Duration,
}

impl<T: Clone> Latest<T> {
    pub fn new(freshness: Duration) -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            freshness,
        }
    }

    /// Replace the held value; readers see it on their next poll.
    pub fn publish(&self, value: T) {
        self.slot.store(Some(Arc::new(Stamped {
            value,
            published_at: Instant::now(),
        })));
    }

    /// The held value if it was published within the freshness window.
    pub fn latest(&self) -> Option<T> {
        let stamped = self.slot.load_full()?;
        if stamped.published_at.elapsed() > self.freshness {
            return None;
        }
        Some(stamped.value.clone())
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }
}

impl FrameSource for Latest<Frame> {
    fn poll_latest_frame(&self) -> Option<Frame> {
        self.latest()
    }
}

impl CollisionSource for Latest<CollisionReading> {
    fn poll_collision_signal(&self) -> Option<CollisionReading> {
        self.latest()
    }
}
