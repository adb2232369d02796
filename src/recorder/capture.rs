//! One accident capture: pre-event snapshot, post-event collection, persistence

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::lock;
use crate::pipeline::FrameRecord;
use crate::sink::PersistenceSink;
use crate::source::FrameSource;

/// Phase of the capture state machine.
///
/// `Idle → Capturing → Persisting → Idle` is the only cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Idle,
    Capturing,
    Persisting,
}

/// Phase tag plus the handle of the task driving the current capture.
///
/// Only the recorder and the capture supervisor move the phase, and only
/// through these transitions.
pub(crate) struct CaptureState {
    pub(crate) phase: CapturePhase,
    pub(crate) trigger: Option<DateTime<Utc>>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl CaptureState {
    pub(crate) fn idle() -> Self {
        Self {
            phase: CapturePhase::Idle,
            trigger: None,
            task: None,
        }
    }

    /// Idle → Capturing.
    pub(crate) fn begin(&mut self, trigger: DateTime<Utc>, task: JoinHandle<()>) {
        debug_assert_eq!(self.phase, CapturePhase::Idle);
        self.phase = CapturePhase::Capturing;
        self.trigger = Some(trigger);
        self.task = Some(task);
    }

    /// Capturing → Persisting.
    fn persisting(&mut self) {
        self.phase = CapturePhase::Persisting;
    }

    /// Back to Idle from any phase.
    pub(crate) fn finish(&mut self) {
        *self = Self::idle();
    }
}

/// What the post-event collector hands back when its window closes.
struct Collected {
    frames: Vec<FrameRecord>,
    cancelled: bool,
}

/// Frames belonging to one accident.
pub struct AccidentCapture {
    pub trigger: DateTime<Utc>,
    pub pre_event: Vec<FrameRecord>,
    pub post_event: Vec<FrameRecord>,
}

impl AccidentCapture {
    pub fn new(trigger: DateTime<Utc>, pre_event: Vec<FrameRecord>) -> Self {
        Self {
            trigger,
            pre_event,
            post_event: Vec::new(),
        }
    }

    /// Pre-event frames followed by post-event frames.
    pub fn into_frames(self) -> Vec<FrameRecord> {
        let mut frames = self.pre_event;
        frames.extend(self.post_event);
        frames
    }
}

/// Rate implied by the span of the recorded frames themselves.
///
/// `None` when fewer than two frames exist; `fallback` when they share one
/// instant.
pub fn effective_rate(frames: &[FrameRecord], fallback: f64) -> Option<f64> {
    let (first, last) = match frames {
        [first, .., last] => (first, last),
        _ => return None,
    };
    let elapsed = last
        .ingested_at
        .saturating_duration_since(first.ingested_at)
        .as_secs_f64();
    if elapsed > 0.0 {
        Some((frames.len() - 1) as f64 / elapsed)
    } else {
        Some(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaptureOutcome {
    Saved { path: PathBuf },
    Skipped { reason: String },
    Failed { error: String },
}

/// Published once per capture, after the recorder is back to Idle.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub trigger: DateTime<Utc>,
    pub pre_event_frames: usize,
    pub post_event_frames: usize,
    pub effective_rate: Option<f64>,
    pub outcome: CaptureOutcome,
}

/// Everything the capture task needs, detached from the recorder.
pub(crate) struct CaptureTask {
    pub(crate) frames: Arc<dyn FrameSource>,
    pub(crate) sink: Arc<dyn PersistenceSink>,
    pub(crate) state: Arc<Mutex<CaptureState>>,
    pub(crate) reports: flume::Sender<CaptureReport>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) post_event: Duration,
    pub(crate) pull_interval: Duration,
    pub(crate) fallback_rate: f64,
}

impl CaptureTask {
    /// Supervise one capture: wait for the collector's frames, persist, and
    /// return the state to Idle.
    ///
    /// The collector shares nothing with the state machine; its frame list
    /// comes back over a channel.
    pub(crate) async fn run(self, mut capture: AccidentCapture) {
        let (done_tx, done_rx) = flume::bounded(1);
        let collector = tokio::spawn(collect_post_event(
            self.frames.clone(),
            self.post_event,
            self.pull_interval,
            self.cancel.clone(),
            done_tx,
        ));
        match done_rx.recv_async().await {
            Ok(collected) => {
                if collected.cancelled {
                    info!(
                        frames = collected.frames.len(),
                        "post-event window cut short"
                    );
                }
                capture.post_event = collected.frames;
            }
            // Sender dropped without a message: the collector panicked.
            Err(_) => match collector.await {
                Err(e) => error!("post-event collection failed: {}", e),
                Ok(()) => error!("post-event collection ended without frames"),
            },
        }

        lock(&self.state).persisting();
        let report = self.persist(capture).await;
        lock(&self.state).finish();

        match &report.outcome {
            CaptureOutcome::Saved { .. } => {}
            CaptureOutcome::Skipped { reason } => info!("capture not persisted: {}", reason),
            CaptureOutcome::Failed { error } => {
                metrics::counter!("blackbox_persist_failures").increment(1);
                warn!("capture persistence failed: {}", error);
            }
        }
        // Nobody listening is fine.
        let _ = self.reports.send(report);
    }

    async fn persist(&self, capture: AccidentCapture) -> CaptureReport {
        let trigger = capture.trigger;
        let pre_event_frames = capture.pre_event.len();
        let post_event_frames = capture.post_event.len();
        let frames = capture.into_frames();

        let report = |rate, outcome| CaptureReport {
            trigger,
            pre_event_frames,
            post_event_frames,
            effective_rate: rate,
            outcome,
        };

        let Some(rate) = effective_rate(&frames, self.fallback_rate) else {
            return report(
                None,
                CaptureOutcome::Skipped {
                    reason: format!("{} frame(s) recorded, need at least 2", frames.len()),
                },
            );
        };

        info!(
            pre = pre_event_frames,
            post = post_event_frames,
            "persisting capture at {:.2} fps",
            rate
        );
        let sink = self.sink.clone();
        let started = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || sink.save(&frames, rate, trigger)).await;
        metrics::histogram!("blackbox_persist_time_ms").record(started.elapsed().as_millis() as f64);

        let outcome = match result {
            Ok(Ok(path)) => CaptureOutcome::Saved { path },
            Ok(Err(e)) => CaptureOutcome::Failed {
                error: e.to_string(),
            },
            Err(e) => CaptureOutcome::Failed {
                error: format!("sink task aborted: {e}"),
            },
        };
        report(Some(rate), outcome)
    }
}

/// Pull frames at a fixed cadence until `duration` elapses or `cancel` is
/// set, then send them to `done`.
async fn collect_post_event(
    frames: Arc<dyn FrameSource>,
    duration: Duration,
    pull_interval: Duration,
    mut cancel: watch::Receiver<bool>,
    done: flume::Sender<Collected>,
) {
    let start = Instant::now();
    let deadline = start + duration;
    let mut ticker = time::interval_at(start + pull_interval, pull_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let expected = (duration.as_secs_f64() / pull_interval.as_secs_f64()).ceil() as usize;
    let mut post = Vec::with_capacity(expected.min(1 << 16));

    let mut cancelled = *cancel.borrow();
    while !cancelled {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.changed() => {
                debug!("post-event collection cancelled");
                cancelled = true;
                break;
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        if let Some(frame) = frames.poll_latest_frame() {
            post.push(FrameRecord::new(frame));
        }
        cancelled = *cancel.borrow();
    }

    debug!(
        frames = post.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "post-event collection done"
    );
    // The supervisor only goes away with the runtime.
    let _ = done.send(Collected {
        frames: post,
        cancelled,
    });
}
