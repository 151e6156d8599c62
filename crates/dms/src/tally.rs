//! Per-frame tallies and session aggregation

use serde::{Deserialize, Serialize};

use crate::classifier::{Emotion, EyeState, FaceState};

/// `numerator / denominator` as a percentage rounded to 2 decimals, or 0
/// when the denominator is 0.
///
/// Rounding is exact (integer arithmetic, ties to even), so complementary
/// ratios such as alertness and drowsiness always add up to 100.00.
pub fn calc_percent(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }

    let scaled = numerator as u128 * 10_000;
    let denominator = denominator as u128;
    let mut hundredths = scaled / denominator;
    let remainder = scaled % denominator;
    if 2 * remainder > denominator || (2 * remainder == denominator && hundredths % 2 == 1) {
        hundredths += 1;
    }
    hundredths as f64 / 100.0
}

/// Counts for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerFrameTally {
    /// Persons whose face produced landmarks
    pub faces: u32,
    pub eyes_open: u32,
    pub eyes_closed: u32,
    pub happy: u32,
    pub sad: u32,
}

impl PerFrameTally {
    /// Count one classified face
    pub fn observe(&mut self, face: FaceState) {
        self.faces += 1;
        match face.eyes {
            EyeState::Open => self.eyes_open += 1,
            EyeState::Closed => self.eyes_closed += 1,
        }
        match face.emotion {
            Emotion::Happy => self.happy += 1,
            Emotion::Sad => self.sad += 1,
            Emotion::Neutral => {}
        }
    }

    pub fn has_faces(&self) -> bool {
        self.faces > 0
    }
}

/// Running sums over every frame that contained at least one face
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionAggregate {
    faces: u64,
    eyes_open: u64,
    eyes_closed: u64,
    happy: u64,
    sad: u64,
    frames_counted: u64,
}

impl SessionAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame's tally. Frames without faces are skipped and do not
    /// enter the denominator; returns whether the tally was counted.
    pub fn commit(&mut self, tally: &PerFrameTally) -> bool {
        if !tally.has_faces() {
            return false;
        }

        self.faces += u64::from(tally.faces);
        self.eyes_open += u64::from(tally.eyes_open);
        self.eyes_closed += u64::from(tally.eyes_closed);
        self.happy += u64::from(tally.happy);
        self.sad += u64::from(tally.sad);
        self.frames_counted += 1;
        true
    }

    pub fn faces(&self) -> u64 {
        self.faces
    }

    pub fn frames_counted(&self) -> u64 {
        self.frames_counted
    }

    pub fn finalize(&self) -> SessionResult {
        SessionResult {
            alertness: calc_percent(self.eyes_open, self.faces),
            drowsiness: calc_percent(self.eyes_closed, self.faces),
            happy: calc_percent(self.happy, self.faces),
            sad: calc_percent(self.sad, self.faces),
        }
    }
}

/// Session percentages, each in [0, 100] with 2 decimals
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub alertness: f64,
    pub drowsiness: f64,
    pub happy: f64,
    pub sad: f64,
}
