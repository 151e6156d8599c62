//! Frame sources and the GStreamer-backed decoder

use std::path::Path;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{CaptureError, VideoFrame};

/// Lazy, ordered, finite sequence of decoded frames.
///
/// A stream error item means no further frames can be read.
pub trait FrameSource: Iterator<Item = Result<VideoFrame, CaptureError>> + Send {}

impl<T> FrameSource for T where T: Iterator<Item = Result<VideoFrame, CaptureError>> + Send {}

/// Opens a stored video file as a frame source
pub trait VideoDecoder: Send + Sync {
    /// Open `path`. Fails with [`CaptureError::Open`] when the container is
    /// unreadable; a readable video without frames yields an empty source.
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Decoder timing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// How long the pipeline may take to produce its first frame
    pub preroll_timeout_secs: u64,
    /// How long to wait for the next frame before giving up on the stream
    pub stall_timeout_secs: u64,
    /// Frames queued in the appsink ahead of the consumer
    pub max_buffers: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            preroll_timeout_secs: 10,
            stall_timeout_secs: 30,
            max_buffers: 4,
        }
    }
}

/// Pipeline for decoding `uri` into RGB frames.
///
/// Only the first video stream is exposed. Frames are flipped according to
/// the stream's orientation tag, and there is no `videorate`, so every
/// decoded frame reaches the sink exactly once.
pub(crate) fn pipeline_description(uri: &str, max_buffers: u32) -> String {
    format!(
        "uridecodebin uri=\"{uri}\" expose-all-streams=false caps=\"video/x-raw(ANY)\" \
         ! videoconvert ! videoflip method=automatic ! videoconvert \
         ! video/x-raw,format=RGB \
         ! appsink name=sink sync=false emit-signals=false drop=false max-buffers={max_buffers}",
    )
}

/// Copy `height` rows of `width` RGB pixels out of a buffer whose rows are
/// `stride` bytes apart, dropping row padding.
pub fn pack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>, CaptureError> {
    let row_len = width as usize * 3;
    if width == 0 || height == 0 || stride < row_len {
        return Err(CaptureError::Format(format!(
            "{}x{} with stride {}",
            width, height, stride
        )));
    }

    let needed = stride * (height as usize - 1) + row_len;
    if data.len() < needed {
        return Err(CaptureError::Truncated {
            expected: needed,
            got: data.len(),
        });
    }

    if stride == row_len {
        return Ok(data[..row_len * height as usize].to_vec());
    }

    let mut packed = Vec::with_capacity(row_len * height as usize);
    for row in data.chunks(stride).take(height as usize) {
        packed.extend_from_slice(&row[..row_len]);
    }
    Ok(packed)
}

/// Mid-stream failure reported by the decoder, after `frames` good frames
fn stream_error(reason: &str, frames: u64) -> CaptureError {
    CaptureError::Stream(format!("{} after {} frames", reason, frames))
}

/// Decoder built on a GStreamer `uridecodebin` pipeline
pub struct GstDecoder {
    config: DecoderConfig,
}

impl GstDecoder {
    pub fn new(config: DecoderConfig) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Init(e.to_string()))?;
        info!(
            "Creating GStreamer decoder ({}), preroll timeout {}s",
            gst::version_string(),
            config.preroll_timeout_secs
        );
        Ok(Self { config })
    }
}

impl VideoDecoder for GstDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, CaptureError> {
        let absolute = path
            .canonicalize()
            .map_err(|e| CaptureError::Open(format!("{}: {}", path.display(), e)))?;
        let uri = gst::glib::filename_to_uri(&absolute, None)
            .map_err(|e| CaptureError::Open(e.to_string()))?;

        let description = pipeline_description(&uri, self.config.max_buffers);
        debug!("Creating pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CaptureError::Init(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::Init("Failed to cast to Pipeline".to_string()))?;

        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::Init("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::Init("Could not cast to AppSink".to_string()))?;

        let frames = GstFrames {
            pipeline,
            sink,
            stall_timeout: Duration::from_secs(self.config.stall_timeout_secs),
            next_index: 0,
            finished: false,
        };
        frames.preroll(gst::ClockTime::from_seconds(self.config.preroll_timeout_secs))?;
        Ok(Box::new(frames))
    }
}

/// Frames pulled in order from a playing pipeline. Dropping it stops the pipeline.
struct GstFrames {
    pipeline: gst::Pipeline,
    sink: gst_app::AppSink,
    stall_timeout: Duration,
    next_index: u64,
    finished: bool,
}

impl GstFrames {
    /// Bring the pipeline to PLAYING; a container that cannot be
    /// demuxed or decoded fails here.
    fn preroll(&self, timeout: gst::ClockTime) -> Result<(), CaptureError> {
        // A timed-out wait still returns Ok(Async), so check the state reached
        let started = self.pipeline.set_state(gst::State::Paused).is_ok()
            && matches!(self.pipeline.state(timeout), (Ok(_), gst::State::Paused, _));

        if !started {
            let reason = self
                .bus_error()
                .unwrap_or_else(|| "Timeout waiting for pipeline to preroll".to_string());
            return Err(CaptureError::Open(reason));
        }

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CaptureError::Open(e.to_string()))?;
        Ok(())
    }

    /// First error posted on the pipeline bus, with its debug detail
    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(match err.debug() {
                Some(detail) => format!("{} ({})", err.error(), detail),
                None => err.error().to_string(),
            }),
            _ => None,
        }
    }

    fn to_frame(&self, sample: &gst::Sample) -> Result<VideoFrame, CaptureError> {
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Format("sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::Format(e.to_string()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Stream("sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        let stride = info.stride()[0].max(0) as usize;
        let data = pack_rows(map.as_slice(), info.width(), info.height(), stride)?;
        Ok(VideoFrame::new(data, info.width(), info.height(), self.next_index))
    }

    fn stop(&mut self) {
        self.finished = true;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {}", e);
        }
    }
}

impl Iterator for GstFrames {
    type Item = Result<VideoFrame, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let poll = gst::ClockTime::from_mseconds(100);
        let deadline = Instant::now() + self.stall_timeout;
        loop {
            if let Some(sample) = self.sink.try_pull_sample(poll) {
                let frame = self.to_frame(&sample);
                match &frame {
                    Ok(_) => self.next_index += 1,
                    Err(_) => self.stop(),
                }
                return Some(frame);
            }

            if self.sink.is_eos() {
                debug!("End of stream after {} frames", self.next_index);
                self.stop();
                return None;
            }

            if let Some(reason) = self.bus_error() {
                self.stop();
                return Some(Err(stream_error(&reason, self.next_index)));
            }

            if Instant::now() >= deadline {
                self.stop();
                let reason = format!("no frame within {}s", self.stall_timeout.as_secs());
                return Some(Err(stream_error(&reason, self.next_index)));
            }
        }
    }
}

impl Drop for GstFrames {
    fn drop(&mut self) {
        if !self.finished {
            self.stop();
        }
    }
}
