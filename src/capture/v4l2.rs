//! V4L2 capture publishing into a latest-value slot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::source::Latest;
use crate::{CaptureConfig, Error, Result};

/// Memory-mapped V4L2 capture
pub struct V4l2Capture {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    config: CaptureConfig,
    sequence: u64,
}

impl V4l2Capture {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", config.device);

        let device = Device::with_path(&config.device)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::Capture(format!(
                "{} doesn't support video capture",
                config.device
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => return Err(Error::UnsupportedFormat(other)),
        };

        let applied = device.set_format(&fmt)?;
        if applied.width != config.width || applied.height != config.height {
            warn!(
                "Device negotiated {}x{} instead of {}x{}",
                applied.width, applied.height, config.width, config.height
            );
        }

        let config = CaptureConfig {
            width: applied.width,
            height: applied.height,
            ..config
        };

        Ok(Self {
            device: Box::new(device),
            stream: None,
            config,
            sequence: 0,
        })
    }

    /// Start streaming with memory-mapped buffers
    pub fn start_stream(&mut self) -> Result<()> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)?;

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }

    /// Blocking dequeue of the next frame
    #[instrument(skip(self))]
    pub fn capture_frame(&mut self) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Capture("stream not started".into()))?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        let mut frame_meta = FrameMetadata::new(
            self.sequence,
            self.config.width,
            self.config.height,
            self.config.format,
        );
        frame_meta.device_timestamp = Some(
            Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        );

        Ok(Frame::new(data, frame_meta))
    }
}

/// Run the capture loop on a dedicated thread until `running` is cleared.
///
/// Capture errors are logged and retried after a short pause; opening the
/// device is the only failure that ends the thread.
pub fn spawn_capture(
    config: CaptureConfig,
    slot: Arc<Latest<Frame>>,
    running: Arc<AtomicBool>,
) -> JoinHandle<Result<()>> {
    std::thread::spawn(move || {
        let mut capture = V4l2Capture::new(config)?;
        capture.start_stream()?;

        while running.load(Ordering::Relaxed) {
            match capture.capture_frame() {
                Ok(frame) => {
                    debug!(sequence = frame.meta.sequence, "captured frame");
                    slot.publish(frame);
                }
                Err(e) => {
                    warn!("Capture error: {}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        info!("Capture thread stopped");
        Ok(())
    })
}
