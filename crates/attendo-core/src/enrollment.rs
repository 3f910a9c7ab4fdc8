//! Template enrollment from multiple face samples.
//!
//! A session accepts samples captured under varying pose and lighting,
//! rejects ones that are too small or near-identical to recent samples, and
//! averages the accepted descriptors into a single template.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::config::EnrollmentConfig;
use crate::error::CoreError;
use crate::types::{BiometricTemplate, BoundingBox, Descriptor};

/// How many recent samples a new one is compared against.
const RECENT_WINDOW: usize = 3;

/// Why a single sample was not accepted. The session stays usable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleRejection {
    #[error("face too small ({width}x{height}, minimum {min})")]
    FaceTooSmall { width: u32, height: u32, min: u32 },
    #[error("face too similar to a recent sample (distance {distance:.3})")]
    TooSimilar { distance: f32 },
    #[error("maximum samples ({0}) reached")]
    SessionFull(usize),
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("insufficient samples: need at least {min}, got {got}")]
    InsufficientSamples { min: usize, got: usize },
    #[error(transparent)]
    Core(#[from] CoreError),
}

pub struct EnrollmentSession {
    identity: String,
    dimension: usize,
    config: EnrollmentConfig,
    samples: Vec<Descriptor>,
}

impl EnrollmentSession {
    pub fn new(
        identity: impl Into<String>,
        dimension: usize,
        config: EnrollmentConfig,
    ) -> Result<Self, CoreError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(CoreError::EmptyIdentity);
        }
        Ok(Self {
            identity,
            dimension,
            samples: Vec::with_capacity(config.max_samples),
            config,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn accepted(&self) -> usize {
        self.samples.len()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.config.max_samples
    }

    /// Offer one sample. Returns the number of accepted samples so far.
    pub fn add_sample(
        &mut self,
        bbox: &BoundingBox,
        descriptor: Descriptor,
    ) -> Result<usize, SampleRejection> {
        if self.is_full() {
            return Err(SampleRejection::SessionFull(self.config.max_samples));
        }
        descriptor.validate(self.dimension)?;

        let min = self.config.min_face_size;
        if bbox.width() < min || bbox.height() < min {
            return Err(SampleRejection::FaceTooSmall {
                width: bbox.width(),
                height: bbox.height(),
                min,
            });
        }

        let recent = self.samples.len().saturating_sub(RECENT_WINDOW);
        let nearest = self.samples[recent..]
            .iter()
            .map(|s| s.distance(&descriptor))
            .min_by(f32::total_cmp);
        if let Some(distance) = nearest {
            if distance < self.config.duplicate_threshold {
                return Err(SampleRejection::TooSimilar { distance });
            }
        }

        self.samples.push(descriptor);
        tracing::debug!(
            identity = %self.identity,
            accepted = self.samples.len(),
            "enrollment sample accepted"
        );
        Ok(self.samples.len())
    }

    /// Average the accepted samples into a template.
    pub fn finish(self, created_at: NaiveDateTime) -> Result<BiometricTemplate, EnrollError> {
        let got = self.samples.len();
        if got < self.config.min_samples {
            tracing::warn!(
                identity = %self.identity,
                got,
                min = self.config.min_samples,
                "enrollment aborted: insufficient samples"
            );
            return Err(EnrollError::InsufficientSamples {
                min: self.config.min_samples,
                got,
            });
        }

        let descriptor = Descriptor::mean(&self.samples).ok_or(EnrollError::InsufficientSamples {
            min: self.config.min_samples,
            got,
        })?;
        descriptor.validate(self.dimension)?;

        tracing::info!(identity = %self.identity, samples = got, "enrollment complete");
        Ok(BiometricTemplate {
            identity: self.identity,
            descriptor,
            sample_count: got,
            created_at,
        })
    }
}
