use std::io;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use blackbox::capture::{Frame, FrameMetadata, PixelFormat};
use blackbox::recorder::{CapturePhase, TriggerOutcome};
use blackbox::{
    AccidentRecorder, CaptureOutcome, CaptureReport, CollisionReading, Error, FrameRecord, Latest,
    PersistenceSink, RecorderConfig,
};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

struct Saved {
    frames: Vec<FrameRecord>,
    rate: f64,
    trigger: DateTime<Utc>,
}

/// Keeps persisted captures in memory.
#[derive(Default)]
struct MemorySink {
    saved: Mutex<Vec<Saved>>,
    fail: bool,
}

impl MemorySink {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

impl PersistenceSink for MemorySink {
    fn save(
        &self,
        frames: &[FrameRecord],
        effective_rate: f64,
        trigger: DateTime<Utc>,
    ) -> blackbox::Result<PathBuf> {
        if self.fail {
            return Err(Error::Io(io::Error::other("disk full")));
        }
        let mut saved = self.saved.lock().unwrap();
        saved.push(Saved {
            frames: frames.to_vec(),
            rate: effective_rate,
            trigger,
        });
        Ok(PathBuf::from(format!("memory-{}", saved.len())))
    }
}

struct Rig {
    recorder: Arc<AccidentRecorder>,
    frames: Arc<Latest<Frame>>,
    collisions: Arc<Latest<CollisionReading>>,
    sink: Arc<MemorySink>,
}

fn rig_with(config: RecorderConfig, sink: MemorySink) -> Rig {
    let frames = Arc::new(Latest::new(Duration::from_secs(2)));
    let collisions = Arc::new(Latest::new(Duration::from_secs(2)));
    let sink = Arc::new(sink);
    let recorder = Arc::new(AccidentRecorder::new(
        config,
        frames.clone(),
        collisions.clone(),
        sink.clone(),
    ));
    Rig {
        recorder,
        frames,
        collisions,
        sink,
    }
}

fn rig() -> Rig {
    rig_with(RecorderConfig::default(), MemorySink::default())
}

fn frame(sequence: u64) -> Frame {
    Frame::new(
        vec![0u8; 3],
        FrameMetadata::new(sequence, 1, 1, PixelFormat::Rgb24),
    )
}

/// Publishes a new frame into `slot` every `1/fps` seconds.
fn spawn_camera(slot: Arc<Latest<Frame>>, fps: f64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs_f64(1.0 / fps));
        for sequence in 0.. {
            ticker.tick().await;
            slot.publish(frame(sequence));
        }
    })
}

async fn next_report(recorder: &AccidentRecorder) -> CaptureReport {
    time::timeout(Duration::from_secs(60), recorder.reports().recv_async())
        .await
        .expect("capture did not finish")
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn retention_converges_to_measured_rate() {
    let rig = rig();
    // 20 fps actual against a 30 fps default
    for sequence in 0..400 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(50)).await;
    }

    let status = rig.recorder.status();
    assert!(
        (status.effective_rate_estimate - 20.0).abs() < 0.05,
        "{}",
        status.effective_rate_estimate
    );
    assert!(status.buffer_capacity.abs_diff(300) <= 5, "{}", status.buffer_capacity);
    assert_eq!(status.retained_frame_count, status.buffer_capacity);
    assert!((status.retained_duration_seconds - 15.0).abs() < 0.3);
    assert_eq!(status.evicted_frames, 400 - status.retained_frame_count as u64);
}

#[tokio::test(start_paused = true)]
async fn retained_duration_holds_under_jitter() {
    let rig = rig();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for sequence in 0..1200 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(rng.random_range(30..=36))).await;
    }

    let status = rig.recorder.status();
    let rate = status.effective_rate_estimate;
    let retained_secs = status.retained_frame_count as f64 / rate;
    assert!(
        (retained_secs - 15.0).abs() <= 2.0 * 5.0 / rate,
        "{retained_secs}s at {rate} fps"
    );
}

#[tokio::test(start_paused = true)]
async fn accident_capture_spans_both_windows() {
    let rig = rig();
    let camera = spawn_camera(rig.frames.clone(), 30.0);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let recorder = rig.recorder.clone();
        tokio::spawn(async move { recorder.run(shutdown_rx).await })
    };

    time::sleep(Duration::from_secs(20)).await;
    let before = rig.recorder.status();
    assert!(!before.is_capturing);
    assert!(
        before.retained_frame_count.abs_diff(450) <= 8,
        "{}",
        before.retained_frame_count
    );

    rig.collisions.publish(CollisionReading::now(true));
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.recorder.phase(), CapturePhase::Capturing);
    assert!(rig.recorder.status().is_capturing);
    rig.collisions.clear();

    let report = next_report(&rig.recorder).await;
    assert!(matches!(report.outcome, CaptureOutcome::Saved { .. }));
    assert!(report.pre_event_frames.abs_diff(450) <= 8);
    assert!(report.post_event_frames.abs_diff(450) <= 5);
    assert!(!rig.recorder.status().is_capturing);

    {
        let saved = rig.sink.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        let capture = &saved[0];
        assert!(capture.frames.len().abs_diff(900) <= 15, "{}", capture.frames.len());
        assert!(capture
            .frames
            .windows(2)
            .all(|pair| pair[0].ingested_at < pair[1].ingested_at));
        assert!((capture.rate - 30.0).abs() < 1.0, "{}", capture.rate);
        assert_eq!(Some(capture.rate), report.effective_rate);
        assert_eq!(capture.trigger, report.trigger);
    }

    // Back in Idle, the next collision starts a fresh capture.
    rig.collisions.publish(CollisionReading::now(true));
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.recorder.phase(), CapturePhase::Capturing);
    rig.collisions.clear();

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();
    camera.abort();

    let second = next_report(&rig.recorder).await;
    assert!(matches!(second.outcome, CaptureOutcome::Saved { .. }));
    assert_eq!(rig.sink.count(), 2);
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn capture_without_post_event_frames_keeps_pre_event() {
    let rig = rig();
    for sequence in 0..60 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(33)).await;
    }

    let started = Instant::now();
    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    let report = next_report(&rig.recorder).await;
    let waited = started.elapsed();

    assert_eq!(report.pre_event_frames, 60);
    assert_eq!(report.post_event_frames, 0);
    assert!(matches!(report.outcome, CaptureOutcome::Saved { .. }));
    assert!(waited >= Duration::from_millis(14_900), "{waited:?}");
    assert!(waited <= Duration::from_secs(16), "{waited:?}");
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn second_trigger_while_capturing_is_dropped() {
    let rig = rig();
    for sequence in 0..10 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(33)).await;
    }

    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::AlreadyActive);
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::AlreadyActive);

    next_report(&rig.recorder).await;
    assert_eq!(rig.sink.count(), 1);
    assert!(rig.recorder.reports().is_empty());

    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    next_report(&rig.recorder).await;
    assert_eq!(rig.sink.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn snapshot_excludes_frames_ingested_after_trigger() {
    let rig = rig();
    for sequence in 0..10 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(33)).await;
    }

    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    for sequence in 10..20 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(33)).await;
    }
    assert_eq!(rig.recorder.status().retained_frame_count, 20);

    next_report(&rig.recorder).await;
    let saved = rig.sink.saved.lock().unwrap();
    let sequences: Vec<u64> = saved[0]
        .frames
        .iter()
        .map(|record| record.frame.meta.sequence)
        .collect();
    assert_eq!(sequences, (0..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn failing_sink_still_returns_to_idle() {
    let rig = rig_with(RecorderConfig::default(), MemorySink::failing());
    for sequence in 0..10 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_millis(33)).await;
    }

    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    let report = next_report(&rig.recorder).await;
    match report.outcome {
        CaptureOutcome::Failed { error } => assert!(error.contains("disk full"), "{error}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);
    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
}

#[tokio::test(start_paused = true)]
async fn single_frame_capture_is_skipped() {
    let rig = rig();
    rig.recorder.ingest(frame(0));

    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    let report = next_report(&rig.recorder).await;
    assert!(matches!(report.outcome, CaptureOutcome::Skipped { .. }));
    assert_eq!(report.effective_rate, None);
    assert_eq!(rig.sink.count(), 0);
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cuts_capture_short_and_persists() {
    let rig = rig();
    let camera = spawn_camera(rig.frames.clone(), 30.0);
    time::sleep(Duration::from_millis(500)).await;
    while rig.recorder.status().retained_frame_count < 10 {
        rig.recorder.run_cycle();
        time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    time::sleep(Duration::from_secs(2)).await;
    rig.recorder.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    camera.abort();

    let report = next_report(&rig.recorder).await;
    assert!(matches!(report.outcome, CaptureOutcome::Saved { .. }));
    assert!(report.post_event_frames.abs_diff(60) <= 2, "{}", report.post_event_frames);
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);
    assert_eq!(rig.recorder.try_trigger(Utc::now()), TriggerOutcome::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn run_cycle_ingests_each_frame_once() {
    let rig = rig();
    assert!(!rig.recorder.run_cycle().ingested);

    rig.frames.publish(frame(1));
    assert!(rig.recorder.run_cycle().ingested);
    time::advance(Duration::from_millis(10)).await;
    assert!(!rig.recorder.run_cycle().ingested);

    rig.frames.publish(frame(2));
    let outcome = rig.recorder.run_cycle();
    assert!(outcome.ingested);
    assert_eq!(outcome.trigger, None);
    assert_eq!(rig.recorder.status().retained_frame_count, 2);

    rig.collisions.publish(CollisionReading::now(false));
    assert_eq!(rig.recorder.run_cycle().trigger, None);
    let reading = CollisionReading::now(true);
    rig.collisions.publish(reading);
    assert_eq!(rig.recorder.run_cycle().trigger, Some(TriggerOutcome::Started));
    assert_eq!(rig.recorder.run_cycle().trigger, None);

    rig.collisions.publish(CollisionReading {
        active: true,
        timestamp: reading.timestamp + chrono::Duration::milliseconds(1),
    });
    assert_eq!(rig.recorder.run_cycle().trigger, Some(TriggerOutcome::AlreadyActive));
    assert_eq!(rig.recorder.run_cycle().trigger, None);
    rig.recorder.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fresh_reading_outliving_capture_is_persisted_once() {
    // Post-event window shorter than the 2s signal freshness.
    let config = RecorderConfig {
        post_event_secs: 0.5,
        ..RecorderConfig::default()
    };
    let rig = rig_with(config, MemorySink::default());
    let camera = spawn_camera(rig.frames.clone(), 30.0);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let recorder = rig.recorder.clone();
        tokio::spawn(async move { recorder.run(shutdown_rx).await })
    };
    time::sleep(Duration::from_secs(1)).await;

    let reading = CollisionReading::now(true);
    rig.collisions.publish(reading);
    time::sleep(Duration::from_secs(3)).await;

    assert_eq!(rig.sink.count(), 1);
    assert!(matches!(
        next_report(&rig.recorder).await.outcome,
        CaptureOutcome::Saved { .. }
    ));
    assert!(rig.recorder.reports().is_empty());
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);

    // A new reading is a new accident.
    rig.collisions.publish(CollisionReading {
        active: true,
        timestamp: reading.timestamp + chrono::Duration::seconds(3),
    });
    time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.sink.count(), 2);

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();
    camera.abort();
}

#[tokio::test(start_paused = true)]
async fn arrival_burst_keeps_capacity_bounded() {
    let rig = rig();
    for sequence in 0..50 {
        rig.recorder.ingest(frame(sequence));
        time::advance(Duration::from_micros(1)).await;
    }

    let status = rig.recorder.status();
    assert!(status.effective_rate_estimate > 1000.0);
    // max_fps 120 over the 15s pre-event window
    assert!(status.buffer_capacity <= 1800, "{}", status.buffer_capacity);
    assert_eq!(status.retained_frame_count, 50);
}

/// Holds every save until the test releases it.
struct GatedSink {
    release: Mutex<mpsc::Receiver<()>>,
}

impl PersistenceSink for GatedSink {
    fn save(
        &self,
        _frames: &[FrameRecord],
        _effective_rate: f64,
        _trigger: DateTime<Utc>,
    ) -> blackbox::Result<PathBuf> {
        self.release
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| Error::Io(io::Error::other("gate dropped")))?;
        Ok(PathBuf::from("gated"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persisting_phase_is_visible_until_save_returns() {
    let (release_tx, release_rx) = mpsc::channel();
    let config = RecorderConfig {
        post_event_secs: 0.1,
        ..RecorderConfig::default()
    };
    let recorder = AccidentRecorder::new(
        config,
        Arc::new(Latest::new(Duration::from_secs(2))),
        Arc::new(Latest::new(Duration::from_secs(2))),
        Arc::new(GatedSink {
            release: Mutex::new(release_rx),
        }),
    );
    recorder.ingest(frame(0));
    std::thread::sleep(Duration::from_millis(5));
    recorder.ingest(frame(1));

    assert_eq!(recorder.try_trigger(Utc::now()), TriggerOutcome::Started);
    time::timeout(Duration::from_secs(5), async {
        while recorder.phase() != CapturePhase::Persisting {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("capture never reached persisting");

    assert!(recorder.status().is_capturing);
    assert_eq!(recorder.try_trigger(Utc::now()), TriggerOutcome::AlreadyActive);
    assert!(recorder.reports().is_empty());

    release_tx.send(()).unwrap();
    let report = next_report(&recorder).await;
    assert!(matches!(report.outcome, CaptureOutcome::Saved { .. }));
    assert_eq!(recorder.phase(), CapturePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn status_serializes_for_monitoring() {
    let rig = rig();
    let status = serde_json::to_value(rig.recorder.status()).unwrap();
    assert_eq!(status["retained_frame_count"], 0);
    assert_eq!(status["is_capturing"], false);
    assert_eq!(status["phase"], "idle");
    assert_eq!(status["buffer_capacity"], 450);
    assert_eq!(status["configured_default_rate"], 30.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_triggers_start_exactly_one_capture() {
    let config = RecorderConfig {
        post_event_secs: 0.2,
        ..RecorderConfig::default()
    };
    let rig = rig_with(config, MemorySink::default());
    rig.recorder.ingest(frame(0));
    std::thread::sleep(Duration::from_millis(5));
    rig.recorder.ingest(frame(1));

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let contenders: Vec<_> = (0..8)
        .map(|_| {
            let recorder = rig.recorder.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                recorder.try_trigger(Utc::now())
            })
        })
        .collect();

    let mut started = 0;
    for contender in contenders {
        match contender.await.unwrap() {
            TriggerOutcome::Started => started += 1,
            TriggerOutcome::AlreadyActive => {}
            TriggerOutcome::ShuttingDown => panic!("not shutting down"),
        }
    }
    assert_eq!(started, 1);

    let report = next_report(&rig.recorder).await;
    assert!(matches!(report.outcome, CaptureOutcome::Saved { .. }));
    assert_eq!(rig.sink.count(), 1);
    assert_eq!(rig.recorder.phase(), CapturePhase::Idle);
}
