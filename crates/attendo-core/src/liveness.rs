//! Passive liveness detection via frame-difference motion analysis.
//!
//! A static photograph or a paused screen held up to the camera produces
//! near-identical face crops across consecutive frames. A live person blinks,
//! breathes and shifts slightly, which changes a measurable number of pixels
//! inside the face box from one frame to the next.
//!
//! Each track keeps a ring buffer of the last K motion signals (the number of
//! face-box pixels whose intensity changed by more than `intensity_delta`).
//! Until the buffer is full the track is COLLECTING; afterwards the rolling
//! mean decides LIVE or SPOOF.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and still images on a screen.
//! - **Does not block:** Replayed video, printed masks worn by a moving
//!   person, or any attack that reproduces natural motion.

use std::collections::{BTreeMap, VecDeque};

use crate::config::LivenessConfig;
use crate::types::{BoundingBox, Frame, LivenessVerdict, TrackId};

/// Grayscale copy of a face region.
#[derive(Debug, Clone)]
struct Crop {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Crop {
    fn from_frame(frame: &Frame, bbox: &BoundingBox) -> Self {
        let mut pixels = Vec::with_capacity(bbox.width() as usize * bbox.height() as usize);
        for y in bbox.top..bbox.bottom {
            for x in bbox.left..bbox.right {
                pixels.push(frame.pixel(x as u32, y as u32));
            }
        }
        Self {
            width: bbox.width(),
            height: bbox.height(),
            pixels,
        }
    }

    /// Nearest-neighbour resample to `width`×`height`.
    fn resized(&self, width: u32, height: u32) -> Crop {
        if self.width == width && self.height == height {
            return self.clone();
        }
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as usize;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as usize;
                pixels.push(self.pixels[sy * self.width as usize + sx]);
            }
        }
        Crop {
            width,
            height,
            pixels,
        }
    }
}

/// Count pixels whose absolute intensity change exceeds `delta`.
fn changed_pixels(previous: &Crop, current: &Crop, delta: u8) -> u32 {
    let previous = previous.resized(current.width, current.height);
    previous
        .pixels
        .iter()
        .zip(current.pixels.iter())
        .filter(|(a, b)| a.abs_diff(**b) > delta)
        .count() as u32
}

/// Liveness state of one spatial face track.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    config: LivenessConfig,
    signals: VecDeque<u32>,
    previous: Option<(BoundingBox, Crop)>,
    verdict: LivenessVerdict,
}

impl LivenessTracker {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            signals: VecDeque::with_capacity(config.history_size),
            previous: None,
            verdict: LivenessVerdict::Collecting,
        }
    }

    pub fn verdict(&self) -> LivenessVerdict {
        self.verdict
    }

    /// Number of motion signals currently buffered.
    pub fn collected(&self) -> usize {
        self.signals.len()
    }

    /// Rolling mean of the buffered motion signals.
    pub fn mean_signal(&self) -> Option<f32> {
        if self.signals.is_empty() {
            return None;
        }
        let total: u64 = self.signals.iter().map(|&s| u64::from(s)).sum();
        Some(total as f32 / self.signals.len() as f32)
    }

    /// Clear the buffer and return to COLLECTING.
    pub fn reset(&mut self) {
        self.signals.clear();
        self.previous = None;
        self.verdict = LivenessVerdict::Collecting;
    }

    /// Feed the face region of `frame` at `bbox` and return the verdict.
    pub fn observe(&mut self, frame: &Frame, bbox: BoundingBox) -> LivenessVerdict {
        let Some(clipped) = bbox.clip(frame.width, frame.height) else {
            tracing::debug!(?bbox, "face box outside frame; restarting liveness");
            self.reset();
            return self.verdict;
        };
        let crop = Crop::from_frame(frame, &clipped);

        let Some((prev_box, prev_crop)) = self.previous.take() else {
            self.previous = Some((clipped, crop));
            return self.verdict;
        };

        if self.is_jump(&prev_box, &clipped) {
            tracing::debug!(?prev_box, current = ?clipped, "face box jumped; restarting liveness");
            self.reset();
            self.previous = Some((clipped, crop));
            return self.verdict;
        }

        let signal = changed_pixels(&prev_crop, &crop, self.config.intensity_delta);
        self.push_signal(signal);
        self.previous = Some((clipped, crop));
        self.verdict
    }

    fn push_signal(&mut self, signal: u32) {
        self.signals.push_back(signal);
        while self.signals.len() > self.config.history_size {
            self.signals.pop_front();
        }

        if self.signals.len() < self.config.history_size {
            return;
        }
        let mean = self.mean_signal().unwrap_or(0.0);
        self.verdict = if mean >= self.config.motion_pixel_threshold {
            LivenessVerdict::Live
        } else {
            LivenessVerdict::Spoof
        };
        tracing::debug!(
            signal,
            mean,
            threshold = self.config.motion_pixel_threshold,
            verdict = %self.verdict,
            "liveness classified"
        );
    }

    /// A shift or resize large enough that differencing would measure
    /// detector jitter rather than facial motion.
    fn is_jump(&self, previous: &BoundingBox, current: &BoundingBox) -> bool {
        let side = previous.side().max(1) as f32;
        let (px, py) = previous.center();
        let (cx, cy) = current.center();
        let shift = ((cx - px).powi(2) + (cy - py).powi(2)).sqrt();
        if shift > self.config.max_center_shift * side {
            return true;
        }

        let scale = |prev: u32, curr: u32| (curr as f32 / prev.max(1) as f32 - 1.0).abs();
        scale(previous.width(), current.width()) > self.config.max_scale_change
            || scale(previous.height(), current.height()) > self.config.max_scale_change
    }
}

struct Track {
    tracker: LivenessTracker,
    last_box: BoundingBox,
    missing_frames: u32,
}

/// Associates detections with spatial tracks and owns one tracker per track.
///
/// Tracks are keyed by spatial continuity, not identity: liveness is
/// established before the matcher's answer is trusted.
pub struct TrackRegistry {
    config: LivenessConfig,
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

impl TrackRegistry {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn verdict(&self, id: TrackId) -> Option<LivenessVerdict> {
        self.tracks.get(&id).map(|t| t.tracker.verdict())
    }

    /// Restart liveness collection for one track. Returns false if unknown.
    pub fn reset(&mut self, id: TrackId) -> bool {
        match self.tracks.get_mut(&id) {
            Some(track) => {
                track.tracker.reset();
                tracing::debug!(track = id, "liveness reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&mut self) {
        for track in self.tracks.values_mut() {
            track.tracker.reset();
        }
    }

    /// Observe every face in `frame`. Returns `(track, verdict)` in the same
    /// order as `frame.faces`. Tracks unseen for `max_missing_frames`
    /// consecutive frames are dropped.
    pub fn observe(&mut self, frame: &Frame) -> Vec<(TrackId, LivenessVerdict)> {
        let mut seen: Vec<TrackId> = Vec::with_capacity(frame.faces.len());
        let mut verdicts = Vec::with_capacity(frame.faces.len());

        for face in &frame.faces {
            let id = match self.associate(&face.bbox, &seen) {
                Some(id) => id,
                None => self.open_track(face.bbox),
            };
            seen.push(id);

            if let Some(track) = self.tracks.get_mut(&id) {
                let verdict = track.tracker.observe(frame, face.bbox);
                track.last_box = face.bbox;
                track.missing_frames = 0;
                verdicts.push((id, verdict));
            }
        }

        let max_missing = self.config.max_missing_frames;
        self.tracks.retain(|id, track| {
            if seen.contains(id) {
                return true;
            }
            track.missing_frames += 1;
            if track.missing_frames >= max_missing {
                tracing::debug!(track = id, "track expired");
                false
            } else {
                true
            }
        });

        verdicts
    }

    fn open_track(&mut self, bbox: BoundingBox) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(
            id,
            Track {
                tracker: LivenessTracker::new(self.config),
                last_box: bbox,
                missing_frames: 0,
            },
        );
        tracing::debug!(track = id, ?bbox, "track opened");
        id
    }

    /// Nearest unclaimed track whose last box centre lies within the
    /// association radius.
    fn associate(&self, bbox: &BoundingBox, claimed: &[TrackId]) -> Option<TrackId> {
        let (cx, cy) = bbox.center();
        self.tracks
            .iter()
            .filter(|(id, _)| !claimed.contains(*id))
            .filter_map(|(id, track)| {
                let (tx, ty) = track.last_box.center();
                let distance = ((cx - tx).powi(2) + (cy - ty).powi(2)).sqrt();
                let radius = self.config.association_radius * track.last_box.side().max(1) as f32;
                (distance <= radius).then_some((*id, distance))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }
}
