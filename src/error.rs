use crate::capture::PixelFormat;

/// Possible errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("jpeg decode error: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
    #[error("H.264 encode error: {0}")]
    H264(#[from] less_avc::Error),
    #[error("MP4 error: {0}")]
    Mp4(#[from] mp4::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("frame payload is {actual} bytes, expected {expected} for its geometry")]
    FrameSize { expected: usize, actual: usize },
    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("need at least {needed} frames to persist, have {have}")]
    NotEnoughFrames { needed: usize, have: usize },
    #[error("{width}x{height} exceeds the MP4 track size limit")]
    TrackSize { width: u32, height: u32 },
    #[error("encoder produced no {0}")]
    MissingParameterSet(&'static str),
    #[error("capture device error: {0}")]
    Capture(String),
}

pub type Result<T> = std::result::Result<T, Error>;
