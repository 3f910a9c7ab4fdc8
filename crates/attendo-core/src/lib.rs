//! attendo-core: face attendance engine.
//!
//! Matches externally computed face descriptors against enrolled templates,
//! gates every match on a motion-based liveness check, and drives a per-day
//! punch-in/punch-out state machine. Detection, encoding, capture and
//! durable storage are supplied by the caller through the types in
//! [`types`], the [`TemplateRepository`] trait and the [`PersistenceSink`]
//! trait.

pub mod attendance;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod sink;
pub mod template_store;
pub mod types;

pub use attendance::{AttendanceRecord, AttendanceStateMachine, DayState, Punch, VerifiedEvent};
pub use config::{
    AttendanceConfig, ConfigError, CoreConfig, EnrollmentConfig, LivenessConfig, MatcherConfig,
    PersistenceConfig,
};
pub use enrollment::{EnrollError, EnrollmentSession, SampleRejection};
pub use error::CoreError;
pub use liveness::{LivenessTracker, TrackRegistry};
pub use matcher::{EuclideanMatcher, Matcher};
pub use orchestrator::{FrameOutcome, Orchestrator};
pub use sink::{AttendanceEvent, BufferedSink, Delivery, PersistenceSink, SinkError};
pub use template_store::{TemplateRepository, TemplateSnapshot, TemplateStore};
pub use types::{
    AttendanceOutcome, BiometricTemplate, BoundingBox, Descriptor, DetectedFace, Frame,
    FrameObservation, LivenessVerdict, MatchResult, PunchType, RejectReason, TrackId,
};
