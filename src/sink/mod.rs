//! Turning a finished capture into a video artifact

pub mod movie;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{info, instrument, warn};

use crate::capture::{decoder, Frame};
use crate::{Error, FrameRecord, OutputConfig, Result};

pub use movie::Mp4H264Writer;

/// Serializes an ordered frame sequence into one named artifact.
///
/// Called off the async runtime; implementations may block.
pub trait PersistenceSink: Send + Sync {
    fn save(
        &self,
        frames: &[FrameRecord],
        effective_rate: f64,
        trigger: DateTime<Utc>,
    ) -> Result<PathBuf>;
}

/// `{prefix}_YYYYmmdd_HHMMSS_mmm.mp4`, lexically sortable by trigger time.
pub fn artifact_name(prefix: &str, trigger: DateTime<Utc>) -> String {
    format!("{prefix}_{}.mp4", trigger.format("%Y%m%d_%H%M%S_%3f"))
}

/// H.264 MP4 files in a directory.
pub struct VideoFileSink {
    directory: PathBuf,
    prefix: String,
    width: u32,
    height: u32,
}

impl VideoFileSink {
    pub fn new(config: &OutputConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        Ok(Self {
            directory: config.directory.clone(),
            prefix: config.file_prefix.clone(),
            width: config.width,
            height: config.height,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Decode to RGB and scale to the output resolution.
    fn normalize(&self, frame: &Frame) -> Result<RgbImage> {
        let img = decoder::decode_rgb(frame)?;
        if img.dimensions() == (self.width, self.height) {
            return Ok(img);
        }
        Ok(imageops::resize(&img, self.width, self.height, FilterType::Triangle))
    }

    fn create_artifact(&self, trigger: DateTime<Utc>) -> Result<(PathBuf, File)> {
        let name = artifact_name(&self.prefix, trigger);
        let mut path = self.directory.join(&name);
        let mut attempt = 0;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                    let stem = name.trim_end_matches(".mp4");
                    path = self.directory.join(format!("{stem}-{attempt}.mp4"));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the number of frames written and skipped.
    fn write_movie(
        &self,
        file: File,
        frames: &[FrameRecord],
        effective_rate: f64,
    ) -> Result<(u32, usize)> {
        let mut writer =
            Mp4H264Writer::new(BufWriter::new(file), self.width, self.height, effective_rate)?;

        let mut skipped = 0usize;
        for record in frames {
            let img = match self.normalize(&record.frame) {
                Ok(img) => img,
                Err(e) => {
                    skipped += 1;
                    warn!(sequence = record.frame.meta.sequence, "skipping frame: {}", e);
                    continue;
                }
            };
            writer.write_frame(&img)?;
        }

        let written = writer.frame_count();
        writer.finish()?.into_inner().map_err(|e| e.into_error())?;
        if written == 0 {
            return Err(Error::NotEnoughFrames {
                needed: 1,
                have: 0,
            });
        }
        Ok((written, skipped))
    }
}

impl PersistenceSink for VideoFileSink {
    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    fn save(
        &self,
        frames: &[FrameRecord],
        effective_rate: f64,
        trigger: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let (path, file) = self.create_artifact(trigger)?;
        let (written, skipped) = match self.write_movie(file, frames, effective_rate) {
            Ok(counts) => counts,
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&path) {
                    warn!("could not remove partial {}: {}", path.display(), rm);
                }
                return Err(e);
            }
        };

        info!(
            "Saved {} ({} frames @ {:.2} fps, {} skipped)",
            path.display(),
            written,
            effective_rate,
            skipped
        );
        Ok(path)
    }
}
