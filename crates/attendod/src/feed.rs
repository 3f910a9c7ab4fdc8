//! JSON-lines frame feed: one request per stdin line, one reply per stdout line.

use std::path::PathBuf;

use attendo_core::{CoreError, DetectedFace, Frame, FrameOutcome, TrackId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("frame needs either `image_path` or `pixels` with `width` and `height`; missing `{0}`")]
    Missing(&'static str),
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Frame(FrameMessage),
    ResetLiveness { track_id: TrackId },
    Enroll {
        identity: String,
        descriptor: Vec<f32>,
        /// Samples the descriptor was averaged from; 1 when omitted.
        #[serde(default)]
        sample_count: Option<usize>,
    },
}

impl FeedMessage {
    pub fn parse(line: &str) -> Result<Self, FeedError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// A frame as it arrives on the feed. Pixels come inline (8-bit grayscale,
/// row-major) or from an image file decoded to luma.
#[derive(Debug, Deserialize)]
pub struct FrameMessage {
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub pixels: Option<Vec<u8>>,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

impl FrameMessage {
    /// Build a validated [`Frame`]. A missing timestamp is stamped with
    /// local now.
    pub fn into_frame(self) -> Result<Frame, FeedError> {
        let timestamp = self
            .timestamp
            .unwrap_or_else(|| chrono::Local::now().naive_local());

        let (width, height, pixels) = match self.image_path {
            Some(path) => {
                let img = image::open(&path).map_err(|source| FeedError::Image {
                    path: path.clone(),
                    source,
                })?;
                let gray = img.to_luma8();
                (gray.width(), gray.height(), gray.into_raw())
            }
            None => (
                self.width.ok_or(FeedError::Missing("width"))?,
                self.height.ok_or(FeedError::Missing("height"))?,
                self.pixels.ok_or(FeedError::Missing("pixels"))?,
            ),
        };

        Ok(Frame::new(timestamp, width, height, pixels, self.faces)?)
    }
}

/// One stdout line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedReply {
    Outcome(FrameOutcome),
    LivenessReset { track_id: TrackId },
    Enrolled { identity: String, dimension: usize },
    Error { message: String },
}

impl FeedReply {
    pub fn error(err: impl std::fmt::Display) -> Self {
        FeedReply::Error {
            message: err.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"unserializable reply: {e}"}}"#)
        })
    }
}
