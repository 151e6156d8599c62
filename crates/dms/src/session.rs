//! Session orchestration: upload bytes in, session percentages out

use std::path::Path;
use std::sync::Arc;

use storage::{StorageError, TempStore};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use video_source::{CaptureError, VideoDecoder, VideoFrame};

use crate::classifier::{ClassifierThresholds, StateClassifier};
use crate::tally::{PerFrameTally, SessionAggregate, SessionResult};
use crate::{DmsError, Models};

/// Session failures, as surfaced to the transport layer
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No video file provided")]
    MissingVideo,

    #[error("Unreadable video: {0}")]
    UnreadableVideo(#[source] CaptureError),

    #[error("Temp storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] DmsError),
}

impl SessionError {
    /// Whether the caller sent something unusable
    pub fn is_client_error(&self) -> bool {
        matches!(self, SessionError::MissingVideo | SessionError::UnreadableVideo(_))
    }
}

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    StorageAcquired,
    Streaming,
    Aggregated,
    Done,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Done | SessionPhase::Failed)
    }

    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Idle, StorageAcquired)
                | (Idle, Failed)
                | (StorageAcquired, Streaming)
                | (StorageAcquired, Failed)
                | (Streaming, Aggregated)
                | (Streaming, Failed)
                | (Aggregated, Done)
        )
    }
}

/// Phases a session has passed through, oldest first
fn advance(trail: &mut Vec<SessionPhase>, next: SessionPhase) {
    let current = trail.last().copied().unwrap_or(SessionPhase::Idle);
    debug_assert!(current.can_advance_to(next), "{:?} -> {:?}", current, next);
    debug!("Session phase {:?} -> {:?}", current, next);
    trail.push(next);
}

/// Result plus diagnostics of a completed session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub result: SessionResult,
    /// Frames read from the video
    pub frames_decoded: u64,
    /// Frames with at least one landmarked face
    pub frames_counted: u64,
    pub faces: u64,
    /// Whether decoding stopped on an unreadable frame
    pub truncated: bool,
    /// Lifecycle phases in the order they were entered, from `Idle` to `Done`
    pub phases: Vec<SessionPhase>,
}

/// Runs the whole pipeline for one upload at a time; share it behind an
/// `Arc` to serve concurrent sessions.
pub struct SessionOrchestrator {
    models: Models,
    decoder: Arc<dyn VideoDecoder>,
    store: TempStore,
    classifier: StateClassifier,
}

impl SessionOrchestrator {
    pub fn new(
        models: Models,
        decoder: Arc<dyn VideoDecoder>,
        store: TempStore,
        thresholds: ClassifierThresholds,
    ) -> Self {
        Self {
            models,
            decoder,
            store,
            classifier: StateClassifier::new(thresholds),
        }
    }

    /// Analyze an uploaded video
    pub fn run(&self, video: &[u8]) -> Result<SessionResult, SessionError> {
        self.run_detailed(video).map(|report| report.result)
    }

    /// Analyze an uploaded video, keeping the diagnostics
    pub fn run_detailed(&self, video: &[u8]) -> Result<SessionReport, SessionError> {
        let span = info_span!("session", id = %Uuid::new_v4());
        let _enter = span.enter();

        let mut phases = vec![SessionPhase::Idle];
        let stored = match self.store.acquire(video) {
            Ok(stored) => stored,
            Err(e) => {
                advance(&mut phases, SessionPhase::Failed);
                record_outcome(None);
                return Err(match e {
                    StorageError::EmptyUpload => SessionError::MissingVideo,
                    other => other.into(),
                });
            }
        };
        advance(&mut phases, SessionPhase::StorageAcquired);

        let outcome = self.process(stored.path(), &mut phases);

        // Terminal either way; release exactly once
        if let Err(e) = stored.release() {
            warn!("Temp storage release failed: {}", e);
        }

        match &outcome {
            Ok(report) => {
                info!(
                    "Session done: {} frames decoded, {} counted, {} faces{}",
                    report.frames_decoded,
                    report.frames_counted,
                    report.faces,
                    if report.truncated { " (stopped early)" } else { "" }
                );
                record_outcome(Some(report));
            }
            Err(e) => {
                warn!("Session failed: {}", e);
                record_outcome(None);
            }
        }
        outcome
    }

    fn process(&self, path: &Path, phases: &mut Vec<SessionPhase>) -> Result<SessionReport, SessionError> {
        let frames = match self.decoder.open(path) {
            Ok(frames) => frames,
            Err(e) => {
                advance(phases, SessionPhase::Failed);
                return Err(SessionError::UnreadableVideo(e));
            }
        };
        advance(phases, SessionPhase::Streaming);

        let mut aggregate = SessionAggregate::new();
        let mut frames_decoded = 0u64;
        let mut truncated = false;

        for item in frames {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) => {
                    // Keep what was aggregated so far
                    warn!("Stopping after {} frames: {}", frames_decoded, e);
                    truncated = true;
                    break;
                }
            };
            frames_decoded += 1;

            let tally = match self.analyze_frame(&frame) {
                Ok(tally) => tally,
                Err(e) => {
                    advance(phases, SessionPhase::Failed);
                    return Err(e.into());
                }
            };
            if aggregate.commit(&tally) {
                debug!("Frame {}: {:?}", frame.index, tally);
            }
        }
        advance(phases, SessionPhase::Aggregated);

        let result = aggregate.finalize();
        advance(phases, SessionPhase::Done);

        Ok(SessionReport {
            result,
            frames_decoded,
            frames_counted: aggregate.frames_counted(),
            faces: aggregate.faces(),
            truncated,
            phases: phases.clone(),
        })
    }

    /// Localize persons in one frame and classify each landmarked face
    pub fn analyze_frame(&self, frame: &VideoFrame) -> Result<PerFrameTally, DmsError> {
        let detections = self.models.localizer.detect(frame)?;
        let mut tally = PerFrameTally::default();

        for detection in detections.iter().filter(|d| d.is_person()) {
            let region = match detection.bbox.clamp_to(frame.width, frame.height) {
                Some((x, y, w, h)) => frame.crop(x, y, w, h),
                None => None,
            };
            let Some(region) = region else {
                debug!("Frame {}: empty crop for {:?}", frame.index, detection.bbox);
                continue;
            };

            if let Some(landmarks) = self.models.landmarks.extract(&region)? {
                tally.observe(self.classifier.classify(&landmarks));
            }
        }
        Ok(tally)
    }
}

fn record_outcome(report: Option<&SessionReport>) {
    match report {
        Some(report) => {
            metrics::counter!("sessions_total", "outcome" => "ok").increment(1);
            metrics::histogram!("session_frames_decoded").record(report.frames_decoded as f64);
            metrics::histogram!("session_faces").record(report.faces as f64);
            if report.truncated {
                metrics::counter!("session_decode_truncated_total").increment(1);
            }
        }
        None => {
            metrics::counter!("sessions_total", "outcome" => "error").increment(1);
        }
    }
}
