//! Continuous retention plus event-triggered capture

mod capture;
mod status;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace};

use crate::capture::Frame;
use crate::pipeline::{FrameRecord, FrameTimingEstimator, RetentionBuffer};
use crate::sink::PersistenceSink;
use crate::source::{CollisionSource, FrameSource};
use crate::RecorderConfig;

pub use capture::{effective_rate, AccidentCapture, CaptureOutcome, CapturePhase, CaptureReport};
pub use status::RecorderStatus;

use capture::{CaptureState, CaptureTask};

/// Lock, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of asking the state machine to leave Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A capture is already in flight; this trigger is dropped.
    AlreadyActive,
    /// [`AccidentRecorder::shutdown`] was requested.
    ShuttingDown,
}

/// What one ingestion cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleOutcome {
    pub ingested: bool,
    pub trigger: Option<TriggerOutcome>,
}

/// The black box: keeps the last `D_pre` seconds of frames and, on a
/// collision signal, persists them together with the following `D_post`
/// seconds.
///
/// The timing estimator, retention buffer and capture state each sit behind
/// their own mutex; none is held across an await or while another is taken,
/// except capture state → buffer when snapshotting on a trigger.
///
/// Methods that may start a capture spawn onto the current Tokio runtime.
pub struct AccidentRecorder {
    config: RecorderConfig,
    frames: Arc<dyn FrameSource>,
    collisions: Arc<dyn CollisionSource>,
    sink: Arc<dyn PersistenceSink>,
    timing: Mutex<FrameTimingEstimator>,
    buffer: Mutex<RetentionBuffer>,
    state: Arc<Mutex<CaptureState>>,
    last_polled: Mutex<Option<(u64, Instant)>>,
    last_reading: Mutex<Option<DateTime<Utc>>>,
    reports_tx: flume::Sender<CaptureReport>,
    reports_rx: flume::Receiver<CaptureReport>,
    cancel: watch::Sender<bool>,
}

impl AccidentRecorder {
    pub fn new(
        config: RecorderConfig,
        frames: Arc<dyn FrameSource>,
        collisions: Arc<dyn CollisionSource>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let timing = FrameTimingEstimator::new(&config);
        let buffer = RetentionBuffer::new(
            config.pre_event(),
            config.default_fps,
            config.resize_hysteresis,
        )
        .with_max_rate(config.max_fps);
        let (reports_tx, reports_rx) = flume::unbounded();
        let (cancel, _) = watch::channel(false);

        info!(
            "Recorder ready: {:.1} fps default, {:.1}s pre-event, {:.1}s post-event",
            config.default_fps, config.pre_event_secs, config.post_event_secs
        );

        Self {
            config,
            frames,
            collisions,
            sink,
            timing: Mutex::new(timing),
            buffer: Mutex::new(buffer),
            state: Arc::new(Mutex::new(CaptureState::idle())),
            last_polled: Mutex::new(None),
            last_reading: Mutex::new(None),
            reports_tx,
            reports_rx,
            cancel,
        }
    }

    /// Take one frame into the retention buffer.
    ///
    /// Updates the rate estimate, resizes the buffer if the estimate moved
    /// far enough, then appends. Returns the new rate estimate.
    pub fn ingest(&self, frame: Frame) -> f64 {
        let record = FrameRecord::new(frame);
        let rate = lock(&self.timing).observe(record.ingested_at);

        let retained = {
            let mut buffer = lock(&self.buffer);
            buffer.resize_if_needed(rate);
            buffer.append(record);
            buffer.len()
        };

        metrics::counter!("blackbox_frames_ingested").increment(1);
        metrics::gauge!("blackbox_rate_estimate").set(rate);
        metrics::gauge!("blackbox_retained_frames").set(retained as f64);
        rate
    }

    /// One pass of the ingestion path: poll a frame, then poll the collision
    /// signal.
    ///
    /// A frame already taken by the previous cycle is not ingested again, and
    /// an active reading is acted on once however long it stays fresh.
    pub fn run_cycle(&self) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        if let Some(frame) = self.frames.poll_latest_frame() {
            let identity = (frame.meta.sequence, frame.timestamp);
            let fresh = lock(&self.last_polled).replace(identity) != Some(identity);
            if fresh {
                self.ingest(frame);
                outcome.ingested = true;
            }
        } else {
            trace!("no frame this cycle");
        }

        match self.collisions.poll_collision_signal() {
            Some(reading) if reading.active => {
                let seen = lock(&self.last_reading).replace(reading.timestamp);
                if seen == Some(reading.timestamp) {
                    trace!("collision reading already handled");
                } else {
                    outcome.trigger = Some(self.try_trigger(reading.timestamp));
                }
            }
            _ => {}
        }
        outcome
    }

    /// Leave Idle: snapshot the buffer and start the capture task.
    ///
    /// Exactly one of any number of concurrent callers gets `Started`.
    #[instrument(skip(self))]
    pub fn try_trigger(&self, trigger: DateTime<Utc>) -> TriggerOutcome {
        let mut state = lock(&self.state);
        if *self.cancel.borrow() {
            return TriggerOutcome::ShuttingDown;
        }
        if state.phase != CapturePhase::Idle {
            metrics::counter!("blackbox_triggers_ignored").increment(1);
            debug!(phase = ?state.phase, "trigger ignored");
            return TriggerOutcome::AlreadyActive;
        }

        let pre_event = lock(&self.buffer).snapshot();
        info!(
            pre_event_frames = pre_event.len(),
            "collision detected, capturing {:.1}s more",
            self.config.post_event_secs
        );

        let task = CaptureTask {
            frames: self.frames.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            reports: self.reports_tx.clone(),
            cancel: self.cancel.subscribe(),
            post_event: self.config.post_event(),
            pull_interval: self.config.pull_interval(),
            fallback_rate: self.config.default_fps,
        };
        let capture = AccidentCapture::new(trigger, pre_event);

        state.begin(trigger, tokio::spawn(task.run(capture)));

        metrics::counter!("blackbox_captures_started").increment(1);
        TriggerOutcome::Started
    }

    /// Receiver of one [`CaptureReport`] per finished capture.
    pub fn reports(&self) -> flume::Receiver<CaptureReport> {
        self.reports_rx.clone()
    }

    pub fn phase(&self) -> CapturePhase {
        lock(&self.state).phase
    }

    /// Read-only snapshot for monitoring.
    pub fn status(&self) -> RecorderStatus {
        let (rate, default_rate, timing_samples) = {
            let timing = lock(&self.timing);
            (timing.estimate(), timing.default_rate(), timing.samples())
        };
        let (retained, capacity, evicted) = {
            let buffer = lock(&self.buffer);
            (buffer.len(), buffer.capacity(), buffer.evicted())
        };
        let (phase, trigger) = {
            let state = lock(&self.state);
            (state.phase, state.trigger)
        };

        RecorderStatus {
            retained_frame_count: retained,
            retained_duration_seconds: retained as f64 / rate,
            buffer_capacity: capacity,
            evicted_frames: evicted,
            is_capturing: phase != CapturePhase::Idle,
            phase,
            active_trigger: trigger,
            effective_rate_estimate: rate,
            configured_default_rate: default_rate,
            timing_samples,
        }
    }

    /// Run the ingestion loop until `shutdown` becomes true, then finish any
    /// capture in flight.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Ingestion loop running every {:?}",
            self.config.cycle_interval()
        );
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Refuse new triggers, cut the current post-event window short and wait
    /// for its persistence to finish.
    pub async fn shutdown(&self) {
        self.cancel.send_replace(true);
        let task = lock(&self.state).task.take();
        if let Some(task) = task {
            info!("Waiting for in-flight capture to persist");
            if let Err(e) = task.await {
                tracing::error!("capture task ended abnormally: {}", e);
                lock(&self.state).finish();
            }
        }
    }
}
