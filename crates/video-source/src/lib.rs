//! Video Source
//!
//! Decodes an uploaded video file into a lazy, ordered sequence of RGB frames.
//! - GStreamer `uridecodebin` pipeline into an RGB appsink
//! - Orientation-corrected, row-packed RGB24 frames
//! - Frame cropping for per-person analysis

pub mod decoder;
pub mod frame;

pub use decoder::{pack_rows, DecoderConfig, FrameSource, GstDecoder, VideoDecoder};
pub use frame::VideoFrame;

use thiserror::Error;

/// Video decoding error types
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("GStreamer setup failed: {0}")]
    Init(String),

    /// The container could not be opened or holds no video stream
    #[error("Failed to open video: {0}")]
    Open(String),

    #[error("Invalid frame geometry: {0}")]
    Format(String),

    /// A frame could not be read after the stream was opened
    #[error("Streaming error: {0}")]
    Stream(String),

    #[error("Truncated frame: got {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },
}
