//! Duration-bounded FIFO of recent frames

use std::time::Duration;

use ringbuf::{traits::*, HeapRb};
use tracing::debug;

use super::FrameRecord;
use crate::MAX_RATE;

/// Ring of the most recent frames, sized to span a target duration.
///
/// The count capacity is `round(rate * target)`, with the rate capped at
/// `max_rate` since the ring allocates its whole capacity up front. A
/// capacity change rebuilds the ring into a fresh allocation, replaying the
/// old contents oldest first so the ring itself discards from the old end.
pub struct RetentionBuffer {
    ring: HeapRb<FrameRecord>,
    target: Duration,
    max_rate: f64,
    hysteresis: usize,
    evicted: u64,
}

impl RetentionBuffer {
    pub fn new(target: Duration, initial_rate: f64, hysteresis: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity_for(initial_rate, MAX_RATE, target)),
            target,
            max_rate: MAX_RATE,
            hysteresis,
            evicted: 0,
        }
    }

    /// Lower the rate ceiling used for sizing.
    pub fn with_max_rate(mut self, max_rate: f64) -> Self {
        self.max_rate = max_rate.min(MAX_RATE);
        let ceiling = capacity_for(self.max_rate, self.max_rate, self.target);
        if self.capacity() > ceiling {
            self.rebuild(ceiling);
        }
        self
    }

    /// Push to the back, evicting the oldest frame when full.
    ///
    /// `None` stands for "no frame this cycle" and leaves the buffer as is.
    pub fn append(&mut self, record: impl Into<Option<FrameRecord>>) {
        let Some(record) = record.into() else {
            return;
        };
        if self.ring.push_overwrite(record).is_some() {
            self.evicted += 1;
        }
    }

    /// Rebuild with a new capacity if the rate moved it past the hysteresis band.
    ///
    /// Returns whether the buffer was rebuilt.
    pub fn resize_if_needed(&mut self, rate_estimate: f64) -> bool {
        let target = capacity_for(rate_estimate, self.max_rate, self.target);
        let current = self.capacity();
        if target.abs_diff(current) <= self.hysteresis {
            return false;
        }
        self.rebuild(target);
        true
    }

    fn rebuild(&mut self, capacity: usize) {
        let current = self.capacity();
        let mut ring = HeapRb::new(capacity);
        for record in self.ring.pop_iter() {
            if ring.push_overwrite(record).is_some() {
                self.evicted += 1;
            }
        }
        self.ring = ring;

        debug!(
            from = current,
            to = capacity,
            retained = self.len(),
            "retention buffer resized"
        );
    }

    /// Independent copy of all retained frames, oldest first.
    pub fn snapshot(&self) -> Vec<FrameRecord> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Frames discarded from the old end since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Time between the oldest and newest retained frame.
    pub fn span(&self) -> Duration {
        match (self.ring.iter().next(), self.ring.iter().last()) {
            (Some(first), Some(last)) => last.ingested_at.saturating_duration_since(first.ingested_at),
            _ => Duration::ZERO,
        }
    }
}

fn capacity_for(rate: f64, max_rate: f64, target: Duration) -> usize {
    let rate = if rate.is_nan() { 0.0 } else { rate.min(max_rate) };
    let slots = (rate * target.as_secs_f64()).round();
    if slots.is_finite() && slots >= 1.0 {
        slots as usize
    } else {
        1
    }
}
