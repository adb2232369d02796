//! H.264 in MP4, encoded with `less-avc`
//!
//! Every frame is an IDR picture, so every sample is a sync sample. The
//! SPS/PPS pair from the first frame goes into the `avcC` box, the remaining
//! NAL units of each frame go into the sample in AVCC (length-prefixed) form.

use std::io::{Seek, Write};

use bytes::Bytes;
use image::RgbImage;
use less_avc::ycbcr_image::{DataPlane, Planes, YCbCrImage};
use less_avc::LessEncoder;
use tracing::trace;

use crate::{Error, Result};

/// Time units that pass in one second.
const MOVIE_TIMESCALE: u32 = 90_000;
const TRACK_ID: u32 = 1;
const MACROBLOCK: u32 = 16;
const ANNEX_B_START: &[u8] = &[0x00, 0x00, 0x00, 0x01];

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

enum Track<W: Write + Seek> {
    Closed,
    /// No frame yet; the track needs the encoder's parameter sets.
    Pending(W),
    Open(mp4::Mp4Writer<W>),
}

pub struct Mp4H264Writer<W: Write + Seek> {
    track: Track<W>,
    encoder: Option<LessEncoder>,
    width: u32,
    height: u32,
    sample_duration: u32,
    frames: u32,
}

impl<W: Write + Seek> Mp4H264Writer<W> {
    /// Prepare a single-track movie of `width`x`height` frames at `fps`.
    pub fn new(inner: W, width: u32, height: u32, fps: f64) -> Result<Self> {
        let too_big = || Error::TrackSize { width, height };
        if width == 0 || height == 0 {
            return Err(too_big());
        }
        u16::try_from(width).map_err(|_| too_big())?;
        u16::try_from(height).map_err(|_| too_big())?;

        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 1.0 };
        let sample_duration = (f64::from(MOVIE_TIMESCALE) / fps)
            .round()
            .clamp(1.0, f64::from(u32::MAX)) as u32;

        Ok(Self {
            track: Track::Pending(inner),
            encoder: None,
            width,
            height,
            sample_duration,
            frames: 0,
        })
    }

    /// Encode one frame and append it as the next sample.
    pub fn write_frame(&mut self, img: &RgbImage) -> Result<()> {
        if img.dimensions() != (self.width, self.height) {
            return Err(Error::FrameSize {
                expected: self.width as usize * self.height as usize * 3,
                actual: img.as_raw().len(),
            });
        }

        let yuv = Yuv420::from_rgb(img);
        let picture = yuv.picture(self.width, self.height);
        let nal_units = match self.encoder.as_mut() {
            Some(encoder) => vec![encoder.encode(&picture)?.to_annex_b_data()],
            None => {
                let (initial, encoder) = LessEncoder::new(&picture)?;
                self.encoder = Some(encoder);
                initial
                    .into_iter()
                    .map(|nal_unit| nal_unit.to_annex_b_data())
                    .collect()
            }
        };

        let mut sps = None;
        let mut pps = None;
        let mut avcc = Vec::new();
        for annex_b in &nal_units {
            let ebsp = annex_b.strip_prefix(ANNEX_B_START).unwrap_or(annex_b);
            let Some(header) = ebsp.first() else {
                continue;
            };
            match header & 0x1f {
                NAL_SPS => sps = Some(ebsp),
                NAL_PPS => pps = Some(ebsp),
                _ => {
                    let len = u32::try_from(ebsp.len()).map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, "NAL unit exceeds 4 GiB")
                    })?;
                    avcc.extend_from_slice(&len.to_be_bytes());
                    avcc.extend_from_slice(ebsp);
                }
            }
        }

        let mut writer = match std::mem::replace(&mut self.track, Track::Closed) {
            Track::Open(writer) => writer,
            Track::Pending(inner) => {
                let sps = sps.ok_or(Error::MissingParameterSet("SPS"))?;
                let pps = pps.ok_or(Error::MissingParameterSet("PPS"))?;
                self.start(inner, sps, pps)?
            }
            Track::Closed => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "movie writer failed earlier",
                )
                .into())
            }
        };

        let sample = mp4::Mp4Sample {
            start_time: u64::from(self.frames) * u64::from(self.sample_duration),
            duration: self.sample_duration,
            rendering_offset: 0,
            is_sync: true,
            bytes: Bytes::from(avcc),
        };
        writer.write_sample(TRACK_ID, &sample)?;
        self.track = Track::Open(writer);
        self.frames += 1;
        trace!(frame = self.frames, "sample written");
        Ok(())
    }

    fn start(&self, inner: W, sps: &[u8], pps: &[u8]) -> Result<mp4::Mp4Writer<W>> {
        let config = mp4::Mp4Config {
            major_brand: "isom".parse()?,
            minor_version: 512,
            compatible_brands: vec!["isom".parse()?, "avc1".parse()?],
            timescale: MOVIE_TIMESCALE,
        };
        let mut writer = mp4::Mp4Writer::write_start(inner, &config)?;

        // Checked in `new`.
        let (width, height) = (self.width as u16, self.height as u16);
        writer.add_track(&mp4::TrackConfig {
            track_type: mp4::TrackType::Video,
            timescale: MOVIE_TIMESCALE,
            language: String::from("und"),
            media_conf: mp4::MediaConfig::AvcConfig(mp4::AvcConfig {
                width,
                height,
                seq_param_set: sps.to_vec(),
                pic_param_set: pps.to_vec(),
            }),
        })?;
        Ok(writer)
    }

    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    /// Write the `moov` box and hand back the underlying writer.
    ///
    /// A writer that never got a frame is returned untouched.
    pub fn finish(self) -> Result<W> {
        match self.track {
            Track::Open(mut writer) => {
                writer.write_end()?;
                Ok(writer.into_writer())
            }
            Track::Pending(inner) => Ok(inner),
            Track::Closed => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "movie writer failed earlier",
            )
            .into()),
        }
    }
}

/// 8-bit 4:2:0 planes padded to whole macroblocks.
struct Yuv420 {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    luma_stride: usize,
    chroma_stride: usize,
}

impl Yuv420 {
    /// BT.601 studio swing. Edge pixels are repeated into the padding.
    fn from_rgb(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        let padded_w = width.div_ceil(MACROBLOCK) * MACROBLOCK;
        let padded_h = height.div_ceil(MACROBLOCK) * MACROBLOCK;
        let (chroma_w, chroma_h) = (padded_w / 2, padded_h / 2);

        let pixel = |x: u32, y: u32| {
            let p = img.get_pixel(x.min(width - 1), y.min(height - 1));
            [i32::from(p[0]), i32::from(p[1]), i32::from(p[2])]
        };

        let mut y_plane = Vec::with_capacity((padded_w * padded_h) as usize);
        for y in 0..padded_h {
            for x in 0..padded_w {
                let [r, g, b] = pixel(x, y);
                y_plane.push(to_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16));
            }
        }

        let mut u_plane = Vec::with_capacity((chroma_w * chroma_h) as usize);
        let mut v_plane = Vec::with_capacity((chroma_w * chroma_h) as usize);
        for cy in 0..chroma_h {
            for cx in 0..chroma_w {
                let mut sum = [0i32; 3];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let p = pixel(2 * cx + dx, 2 * cy + dy);
                    for (acc, c) in sum.iter_mut().zip(p) {
                        *acc += c;
                    }
                }
                let [r, g, b] = sum.map(|s| (s + 2) / 4);
                u_plane.push(to_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128));
                v_plane.push(to_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128));
            }
        }

        Self {
            y: y_plane,
            u: u_plane,
            v: v_plane,
            luma_stride: padded_w as usize,
            chroma_stride: chroma_w as usize,
        }
    }

    fn picture(&self, width: u32, height: u32) -> YCbCrImage<'_> {
        YCbCrImage {
            planes: Planes::YCbCr((
                plane(&self.y, self.luma_stride),
                plane(&self.u, self.chroma_stride),
                plane(&self.v, self.chroma_stride),
            )),
            width,
            height,
        }
    }
}

fn plane(data: &[u8], stride: usize) -> DataPlane<'_> {
    DataPlane {
        data,
        stride,
        bit_depth: less_avc::BitDepth::Depth8,
    }
}

fn to_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
