use std::path::Path;

use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::{Error, Result};

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Find the first capture device offering MJPEG or YUYV
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        // Prefer whichever the device lists first
        for fmt in dev.enum_formats().unwrap_or_default() {
            let format = if fmt.fourcc == FourCC::new(b"MJPG") {
                PixelFormat::Mjpeg
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                PixelFormat::Yuyv4
            } else {
                continue;
            };
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            return Ok(FoundDevice { path, format });
        }
    }

    Err(Error::Capture("no suitable capture device found".into()))
}
