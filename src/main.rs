//! Blackbox accident recorder

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blackbox::capture::{Frame, TestPattern};
use blackbox::{
    AccidentRecorder, CaptureOutcome, CollisionReading, Config, Latest, SourceKind, VideoFileSink,
};
use color_eyre::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blackbox=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Blackbox launching...");

    // Load configuration
    let config_path = std::env::var_os("BLACKBOX_CONFIG").map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!("Writing recordings to {}", config.output.directory.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let frames = Arc::new(Latest::<Frame>::new(config.signals.freshness()));
    let collisions = Arc::new(Latest::<CollisionReading>::new(config.signals.freshness()));

    let producer = Producer::start(&config, frames.clone(), shutdown_rx.clone())?;
    #[cfg(unix)]
    spawn_manual_trigger(collisions.clone())?;

    let sink = Arc::new(VideoFileSink::new(&config.output)?);
    let recorder = Arc::new(AccidentRecorder::new(
        config.recorder.clone(),
        frames,
        collisions,
        sink,
    ));

    let reports = recorder.reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv_async().await {
            match &report.outcome {
                CaptureOutcome::Saved { path } => info!(
                    "Accident recording {} ({} pre + {} post frames)",
                    path.display(),
                    report.pre_event_frames,
                    report.post_event_frames
                ),
                other => warn!("Accident at {} not recorded: {:?}", report.trigger, other),
            }
        }
    });

    let status_recorder = recorder.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_PERIOD);
        loop {
            ticker.tick().await;
            let status = status_recorder.status();
            info!(
                retained = status.retained_frame_count,
                seconds = status.retained_duration_seconds,
                fps = status.effective_rate_estimate,
                phase = ?status.phase,
                "status"
            );
        }
    });

    let runner = {
        let recorder = recorder.clone();
        tokio::spawn(async move { recorder.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send_replace(true);
    runner.await?;
    producer.stop().await;

    info!("Final recorder status: {:?}", recorder.status());
    info!("Blackbox shutting down");
    Ok(())
}

/// Whatever is feeding frames into the latest-frame slot.
enum Producer {
    Pattern(JoinHandle<()>),
    #[cfg(feature = "v4l2")]
    V4l2 {
        running: Arc<std::sync::atomic::AtomicBool>,
        thread: std::thread::JoinHandle<blackbox::Result<()>>,
    },
}

impl Producer {
    fn start(
        config: &Config,
        slot: Arc<Latest<Frame>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let capture = &config.capture;
        match capture.source {
            SourceKind::TestPattern => {
                let pattern =
                    TestPattern::new(capture.width, capture.height, capture.fps, capture.jitter);
                Ok(Producer::Pattern(pattern.spawn(slot, shutdown)))
            }
            #[cfg(feature = "v4l2")]
            SourceKind::V4l2 => {
                let mut capture = capture.clone();
                // Auto-detect capture device if needed
                if capture.device.is_empty() {
                    let found = blackbox::utils::auto_detect_device()?;
                    capture.device = found.path;
                    capture.format = found.format;
                }
                info!("Using capture device: {}", capture.device);

                let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
                let thread = blackbox::capture::spawn_capture(capture, slot, running.clone());
                Ok(Producer::V4l2 { running, thread })
            }
            #[cfg(not(feature = "v4l2"))]
            SourceKind::V4l2 => Err(color_eyre::eyre::eyre!(
                "capture.source = \"v4l2\" needs a build with the `v4l2` feature"
            )),
        }
    }

    async fn stop(self) {
        match self {
            Producer::Pattern(handle) => {
                if let Err(e) = handle.await {
                    warn!("Test pattern producer ended abnormally: {}", e);
                }
            }
            #[cfg(feature = "v4l2")]
            Producer::V4l2 { running, thread } => {
                running.store(false, std::sync::atomic::Ordering::Relaxed);
                match tokio::task::spawn_blocking(move || thread.join()).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => warn!("Capture thread failed: {}", e),
                    _ => warn!("Capture thread panicked"),
                }
            }
        }
    }
}

/// `kill -USR1 <pid>` publishes an active collision reading.
#[cfg(unix)]
fn spawn_manual_trigger(collisions: Arc<Latest<CollisionReading>>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            warn!("Manual collision trigger (SIGUSR1)");
            collisions.publish(CollisionReading::now(true));
        }
    });
    Ok(())
}
