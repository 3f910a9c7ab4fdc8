//! Immutable tuning for every core component.
//!
//! A [`CoreConfig`] is built once (defaults, a TOML file, or environment
//! overrides in the daemon), validated, and then handed to each component's
//! constructor. Nothing in the core mutates thresholds at runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be within [0, 1], got {value}")]
    NotAFraction { field: &'static str, value: f32 },
    #[error("{field} must be a positive finite number, got {value}")]
    NotPositive { field: &'static str, value: f32 },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("min_samples ({min}) must not exceed max_samples ({max})")]
    SampleBounds { min: usize, max: usize },
    #[error("cooldown_secs must not exceed one day, got {0}")]
    CooldownTooLong(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Euclidean distance at or beyond which a candidate is rejected and its
    /// confidence is zero. Lower is stricter.
    pub distance_threshold: f32,
    /// Minimum derived confidence for acceptance.
    pub confidence_threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.6,
            confidence_threshold: 0.55,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Number of motion signals (K) collected before a verdict is given.
    pub history_size: usize,
    /// Mean changed-pixel count at or above which a track is LIVE.
    pub motion_pixel_threshold: f32,
    /// Per-pixel absolute intensity change that counts as "changed".
    pub intensity_delta: u8,
    /// Centre shift, as a fraction of the previous box's larger side, beyond
    /// which the box is treated as a jump and the buffer restarts.
    pub max_center_shift: f32,
    /// Relative width/height change beyond which the box is treated as a jump.
    pub max_scale_change: f32,
    /// Centre distance, as a multiple of a track's box side, within which a
    /// new detection continues that track.
    pub association_radius: f32,
    /// Consecutive frames a track may go unseen before it expires.
    pub max_missing_frames: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            history_size: 10,
            motion_pixel_threshold: 15.0,
            intensity_delta: 10,
            max_center_shift: 0.25,
            max_scale_change: 0.25,
            association_radius: 1.0,
            max_missing_frames: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    /// Window after an identity's last transition during which further
    /// accepted events are reported as duplicates.
    pub cooldown_secs: u64,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self { cooldown_secs: 5 }
    }
}

impl AttendanceConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs.min(86_400) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub min_samples: usize,
    pub max_samples: usize,
    /// Minimum face box width and height, in pixels.
    pub min_face_size: u32,
    /// A sample closer than this to one of the last three accepted samples
    /// adds no information and is rejected.
    pub duplicate_threshold: f32,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            min_samples: 15,
            max_samples: 30,
            min_face_size: 50,
            duplicate_threshold: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Attendance events held for retry while the sink is unavailable.
    pub buffer_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Descriptor dimension D shared by every template and query.
    pub descriptor_dim: usize,
    pub matcher: MatcherConfig,
    pub liveness: LivenessConfig,
    pub attendance: AttendanceConfig,
    pub enrollment: EnrollmentConfig,
    pub persistence: PersistenceConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            descriptor_dim: 128,
            matcher: MatcherConfig::default(),
            liveness: LivenessConfig::default(),
            attendance: AttendanceConfig::default(),
            enrollment: EnrollmentConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.descriptor_dim == 0 {
            return Err(ConfigError::Zero {
                field: "descriptor_dim",
            });
        }
        positive("distance_threshold", self.matcher.distance_threshold)?;
        fraction("confidence_threshold", self.matcher.confidence_threshold)?;

        let l = &self.liveness;
        if l.history_size == 0 {
            return Err(ConfigError::Zero {
                field: "history_size",
            });
        }
        if !(l.motion_pixel_threshold.is_finite() && l.motion_pixel_threshold >= 0.0) {
            return Err(ConfigError::NotPositive {
                field: "motion_pixel_threshold",
                value: l.motion_pixel_threshold,
            });
        }
        positive("max_center_shift", l.max_center_shift)?;
        positive("max_scale_change", l.max_scale_change)?;
        positive("association_radius", l.association_radius)?;
        if l.max_missing_frames == 0 {
            return Err(ConfigError::Zero {
                field: "max_missing_frames",
            });
        }

        if self.attendance.cooldown_secs > 86_400 {
            return Err(ConfigError::CooldownTooLong(self.attendance.cooldown_secs));
        }

        let e = &self.enrollment;
        if e.min_samples == 0 {
            return Err(ConfigError::Zero {
                field: "min_samples",
            });
        }
        if e.min_samples > e.max_samples {
            return Err(ConfigError::SampleBounds {
                min: e.min_samples,
                max: e.max_samples,
            });
        }
        if !(e.duplicate_threshold.is_finite() && e.duplicate_threshold >= 0.0) {
            return Err(ConfigError::NotPositive {
                field: "duplicate_threshold",
                value: e.duplicate_threshold,
            });
        }

        if self.persistence.buffer_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "buffer_capacity",
            });
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn fraction(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::NotAFraction { field, value })
    }
}
