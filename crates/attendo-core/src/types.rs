use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identifier of a spatial face track, assigned by [`crate::TrackRegistry`].
pub type TrackId = u64;

/// A fixed-length face descriptor produced by an external encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance. Both descriptors must have the same dimension;
    /// callers validate this against the store before matching.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }

    /// Elementwise mean of equally sized descriptors. `None` for an empty slice.
    pub fn mean(samples: &[Descriptor]) -> Option<Descriptor> {
        let first = samples.first()?;
        let mut sums = vec![0.0f64; first.dim()];
        for sample in samples {
            for (sum, v) in sums.iter_mut().zip(sample.values.iter()) {
                *sum += f64::from(*v);
            }
        }
        let n = samples.len() as f64;
        Some(Descriptor::new(
            sums.into_iter().map(|s| (s / n) as f32).collect(),
        ))
    }

    /// Check dimension and value validity against a store dimension.
    pub fn validate(&self, expected_dim: usize) -> Result<(), CoreError> {
        if self.dim() != expected_dim {
            return Err(CoreError::DimensionMismatch {
                expected: expected_dim,
                got: self.dim(),
            });
        }
        if !self.is_finite() {
            return Err(CoreError::InvalidDescriptorValue);
        }
        Ok(())
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Face bounding box in pixel coordinates. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) as f32 / 2.0,
            (self.top + self.bottom) as f32 / 2.0,
        )
    }

    /// Larger of width and height.
    pub fn side(&self) -> u32 {
        self.width().max(self.height())
    }

    /// Intersect with a `width`×`height` image. `None` if nothing remains.
    pub fn clip(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let clipped = BoundingBox {
            left: self.left.max(0),
            top: self.top.max(0),
            right: self.right.min(width as i32),
            bottom: self.bottom.min(height as i32),
        };
        if clipped.right <= clipped.left || clipped.bottom <= clipped.top {
            None
        } else {
            Some(clipped)
        }
    }
}

/// One detected face: its box and the descriptor computed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// One analyzed frame: an 8-bit grayscale image plus the faces found in it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: NaiveDateTime,
    pub width: u32,
    pub height: u32,
    /// Row-major luma, `width * height` bytes.
    pub pixels: Vec<u8>,
    pub faces: Vec<DetectedFace>,
}

impl Frame {
    pub fn new(
        timestamp: NaiveDateTime,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        faces: Vec<DetectedFace>,
    ) -> Result<Self, CoreError> {
        let frame = Self {
            timestamp,
            width,
            height,
            pixels,
            faces,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let expected = self.width as usize * self.height as usize;
        if self.pixels.len() != expected {
            return Err(CoreError::InvalidFrame {
                width: self.width,
                height: self.height,
                expected,
                got: self.pixels.len(),
            });
        }
        Ok(())
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }
}

/// The single face of a frame, bound to the track that observed it.
#[derive(Debug, Clone)]
pub struct FrameObservation {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
    pub timestamp: NaiveDateTime,
}

/// An enrolled identity. Immutable; re-enrollment replaces it wholesale.
///
/// `sample_count` is at least `min_samples` for templates built by an
/// enrollment session. Descriptors averaged elsewhere carry whatever count
/// their producer reports, 1 when none is given.
#[derive(Debug, Clone, PartialEq)]
pub struct BiometricTemplate {
    pub identity: String,
    pub descriptor: Descriptor,
    pub sample_count: usize,
    pub created_at: NaiveDateTime,
}

/// Outcome of matching one query descriptor against the template set.
///
/// `identity` is `None` for UNKNOWN. `distance` and `confidence` describe the
/// nearest candidate even when it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Option<String>,
    pub distance: f32,
    pub confidence: f32,
}

impl MatchResult {
    /// Result for an empty template store.
    pub fn unknown() -> Self {
        Self {
            identity: None,
            distance: f32::INFINITY,
            confidence: 0.0,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessVerdict {
    /// Motion buffer not yet full.
    Collecting,
    Live,
    Spoof,
}

impl LivenessVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessVerdict::Collecting => "COLLECTING",
            LivenessVerdict::Live => "LIVE",
            LivenessVerdict::Spoof => "SPOOF",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COLLECTING" => Some(LivenessVerdict::Collecting),
            "LIVE" => Some(LivenessVerdict::Live),
            "SPOOF" => Some(LivenessVerdict::Spoof),
            _ => None,
        }
    }
}

impl fmt::Display for LivenessVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchType {
    #[serde(rename = "PUNCH_IN")]
    In,
    #[serde(rename = "PUNCH_OUT")]
    Out,
}

impl PunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PunchType::In => "PUNCH_IN",
            PunchType::Out => "PUNCH_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUNCH_IN" => Some(PunchType::In),
            "PUNCH_OUT" => Some(PunchType::Out),
            _ => None,
        }
    }
}

impl fmt::Display for PunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    NoFace,
    MultipleFaces,
    UnknownFace,
    LivenessFailed,
    /// Single face present but its liveness buffer is still filling.
    LivenessPending,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoFace => "NO_FACE",
            RejectReason::MultipleFaces => "MULTIPLE_FACES",
            RejectReason::UnknownFace => "UNKNOWN_FACE",
            RejectReason::LivenessFailed => "LIVENESS_FAILED",
            RejectReason::LivenessPending => "LIVENESS_PENDING",
        }
    }
}

/// The single classified outcome every processed frame yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceOutcome {
    PunchIn,
    PunchOut,
    Duplicate,
    Rejected(RejectReason),
}

impl AttendanceOutcome {
    pub fn is_transition(&self) -> bool {
        matches!(self, AttendanceOutcome::PunchIn | AttendanceOutcome::PunchOut)
    }
}

impl fmt::Display for AttendanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceOutcome::PunchIn => f.write_str("PUNCH_IN"),
            AttendanceOutcome::PunchOut => f.write_str("PUNCH_OUT"),
            AttendanceOutcome::Duplicate => f.write_str("DUPLICATE"),
            AttendanceOutcome::Rejected(reason) => write!(f, "REJECTED({})", reason.as_str()),
        }
    }
}
