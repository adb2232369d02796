//! Synthetic frame producer for bench runs without a camera

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::source::Latest;

/// Moving vertical bar over a gradient, RGB24.
pub struct TestPattern {
    width: u32,
    height: u32,
    fps: f64,
    jitter: f64,
    sequence: u64,
}

impl TestPattern {
    /// `jitter` is the fraction of the nominal frame interval by which each
    /// interval is stretched, cycling deterministically over eight frames.
    pub fn new(width: u32, height: u32, fps: f64, jitter: f64) -> Self {
        Self {
            width,
            height,
            fps,
            jitter: jitter.clamp(0.0, 1.0),
            sequence: 0,
        }
    }

    pub fn next_frame(&mut self) -> Frame {
        self.sequence += 1;
        let (w, h) = (self.width as usize, self.height as usize);
        let bar = (self.sequence as usize * 4) % w.max(1);

        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                if x.abs_diff(bar) < 4 {
                    data.extend_from_slice(&[255, 255, 255]);
                } else {
                    data.push((x * 255 / w.max(1)) as u8);
                    data.push((y * 255 / h.max(1)) as u8);
                    data.push(64);
                }
            }
        }

        Frame::new(
            Bytes::from(data),
            FrameMetadata::new(self.sequence, self.width, self.height, PixelFormat::Rgb24),
        )
    }

    fn next_interval(&self) -> Duration {
        let nominal = 1.0 / self.fps;
        let phase = (self.sequence % 8) as f64 / 7.0;
        Duration::from_secs_f64(nominal * (1.0 + self.jitter * phase))
    }

    /// Publish frames into `slot` until `shutdown` flips to true.
    pub fn spawn(
        mut self,
        slot: Arc<Latest<Frame>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Test pattern producer started: {}x{} @ {:.1} fps",
                self.width, self.height, self.fps
            );
            loop {
                slot.publish(self.next_frame());
                tokio::select! {
                    _ = tokio::time::sleep(self.next_interval()) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("Test pattern producer stopped");
        })
    }
}
