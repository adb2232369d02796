use image::{GrayImage, RgbImage};
use jpeg_decoder::Decoder;

use super::frame::{Frame, PixelFormat};
use crate::{Error, Result};

/// Decode any supported frame into packed RGB8.
pub fn decode_rgb(frame: &Frame) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let data = &frame.data[..];

    if let Some(expected) = frame.meta.format.frame_len(width, height) {
        if data.len() != expected {
            return Err(Error::FrameSize {
                expected,
                actual: data.len(),
            });
        }
    }

    match frame.meta.format {
        PixelFormat::Rgb24 => packed(width, height, data.to_vec()),
        PixelFormat::Bgr24 => {
            let mut pixels = data.to_vec();
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            packed(width, height, pixels)
        }
        PixelFormat::Gray8 => gray_to_rgb(width, height, data.to_vec()),
        PixelFormat::Yuyv4 => packed(width, height, yuyv_to_rgb(data)),
        PixelFormat::Mjpeg => decode_mjpeg(data),
    }
}

fn decode_mjpeg(data: &[u8]) -> Result<RgbImage> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or(Error::UnsupportedFormat(PixelFormat::Mjpeg))?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => packed(width, height, pixels),
        jpeg_decoder::PixelFormat::L8 => gray_to_rgb(width, height, pixels),
        _ => Err(Error::UnsupportedFormat(PixelFormat::Mjpeg)),
    }
}

fn packed(width: u32, height: u32, pixels: Vec<u8>) -> Result<RgbImage> {
    let actual = pixels.len();
    RgbImage::from_raw(width, height, pixels).ok_or(Error::FrameSize {
        expected: width as usize * height as usize * 3,
        actual,
    })
}

// Single-channel frames are expanded to three identical channels.
fn gray_to_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<RgbImage> {
    let actual = pixels.len();
    let gray = GrayImage::from_raw(width, height, pixels).ok_or(Error::FrameSize {
        expected: width as usize * height as usize,
        actual,
    })?;
    Ok(image::DynamicImage::ImageLuma8(gray).to_rgb8())
}

/// BT.601 full-range YUYV (YUY2) to RGB24.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        for y in [y0, y1] {
            let y = f32::from(y);
            let u = f32::from(u) - 128.0;
            let v = f32::from(v) - 128.0;
            rgb.push(clamp(y + 1.402 * v));
            rgb.push(clamp(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp(y + 1.772 * u));
        }
    }
    rgb
}

fn clamp(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
