pub mod decoder;
pub mod frame;
pub mod pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use pattern::TestPattern;
#[cfg(feature = "v4l2")]
pub use v4l2::{spawn_capture, V4l2Capture};
