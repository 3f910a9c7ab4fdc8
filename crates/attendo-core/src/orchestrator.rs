use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::attendance::{AttendanceStateMachine, VerifiedEvent};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::liveness::TrackRegistry;
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::sink::{AttendanceEvent, BufferedSink, Delivery, PersistenceSink};
use crate::template_store::TemplateStore;
use crate::types::{
    AttendanceOutcome, BiometricTemplate, Descriptor, Frame, FrameObservation, LivenessVerdict,
    MatchResult, RejectReason, TrackId,
};

/// Everything decided about one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameOutcome {
    pub timestamp: NaiveDateTime,
    pub faces: usize,
    /// Track of the single face; `None` for empty or multi-face frames.
    pub track_id: Option<TrackId>,
    pub match_result: Option<MatchResult>,
    pub liveness: Option<LivenessVerdict>,
    pub outcome: AttendanceOutcome,
}

/// Sequences liveness, matching and attendance for one camera.
///
/// Frames must be fed in order from a single worker. Liveness is updated for
/// every detected face first; duplicate suppression is applied afterwards,
/// and a successful transition restarts that track's liveness collection.
pub struct Orchestrator<S> {
    templates: Arc<TemplateStore>,
    matcher: EuclideanMatcher,
    tracks: TrackRegistry,
    attendance: AttendanceStateMachine,
    sink: BufferedSink<S>,
    current_date: Option<NaiveDate>,
}

impl<S: PersistenceSink> Orchestrator<S> {
    pub fn new(config: &CoreConfig, templates: Arc<TemplateStore>, sink: S) -> Self {
        Self {
            templates,
            matcher: EuclideanMatcher::new(config.matcher),
            tracks: TrackRegistry::new(config.liveness),
            attendance: AttendanceStateMachine::new(config.attendance),
            sink: BufferedSink::new(sink, config.persistence.buffer_capacity),
            current_date: None,
        }
    }

    /// Classify one frame. Only malformed input is an error; every valid
    /// frame yields exactly one outcome.
    pub fn recognize_frame(&mut self, frame: &Frame) -> Result<FrameOutcome, CoreError> {
        frame.validate()?;
        let dimension = self.templates.dimension();
        for face in &frame.faces {
            face.descriptor.validate(dimension)?;
        }
        self.roll_date(frame.timestamp.date());
        self.sink.retry();

        let verdicts = self.tracks.observe(frame);

        let rejected = |reason| FrameOutcome {
            timestamp: frame.timestamp,
            faces: frame.faces.len(),
            track_id: None,
            match_result: None,
            liveness: None,
            outcome: AttendanceOutcome::Rejected(reason),
        };

        let (face, (track_id, liveness)) = match (frame.faces.as_slice(), verdicts.as_slice()) {
            ([], _) => return Ok(rejected(RejectReason::NoFace)),
            ([face], [verdict]) => (face, *verdict),
            _ => {
                tracing::warn!(faces = frame.faces.len(), "multiple faces in frame; rejected");
                return Ok(rejected(RejectReason::MultipleFaces));
            }
        };

        let observation = FrameObservation {
            track_id,
            bbox: face.bbox,
            descriptor: face.descriptor.clone(),
            timestamp: frame.timestamp,
        };

        let result = self
            .matcher
            .compare(&observation.descriptor, &self.templates.iterate());
        let outcome = self.decide(&observation, &result, liveness);

        Ok(FrameOutcome {
            timestamp: frame.timestamp,
            faces: 1,
            track_id: Some(track_id),
            match_result: Some(result),
            liveness: Some(liveness),
            outcome,
        })
    }

    fn decide(
        &mut self,
        observation: &FrameObservation,
        result: &MatchResult,
        liveness: LivenessVerdict,
    ) -> AttendanceOutcome {
        if liveness == LivenessVerdict::Spoof {
            tracing::warn!(
                track = observation.track_id,
                candidate = ?result.identity,
                "liveness check failed"
            );
            return AttendanceOutcome::Rejected(RejectReason::LivenessFailed);
        }
        if !result.is_accepted() {
            return AttendanceOutcome::Rejected(RejectReason::UnknownFace);
        }
        let Some(event) = VerifiedEvent::new(result, liveness, observation.timestamp) else {
            return AttendanceOutcome::Rejected(RejectReason::LivenessPending);
        };

        let (outcome, persisted) = self.attendance.apply(&event);
        if let Some(persisted) = persisted {
            if self.sink.append(persisted) == Delivery::Buffered {
                tracing::debug!(pending = self.sink.pending(), "attendance event buffered");
            }
            // A verdict must not carry over into an unrelated session.
            self.tracks.reset(observation.track_id);
        }
        outcome
    }

    /// Restart liveness collection for `track_id`.
    pub fn reset_liveness(&mut self, track_id: TrackId) {
        if !self.tracks.reset(track_id) {
            tracing::debug!(track = track_id, "reset requested for unknown track");
        }
    }

    /// Enroll a pre-averaged descriptor. Replaces any existing template.
    pub fn enroll(
        &self,
        identity: &str,
        descriptor: Descriptor,
    ) -> Result<BiometricTemplate, CoreError> {
        self.enroll_averaged(identity, descriptor, 1)
    }

    /// Enroll a descriptor the caller averaged from `sample_count` samples.
    /// The sample bounds of an [`EnrollmentSession`](crate::EnrollmentSession)
    /// are not re-checked here.
    pub fn enroll_averaged(
        &self,
        identity: &str,
        descriptor: Descriptor,
        sample_count: usize,
    ) -> Result<BiometricTemplate, CoreError> {
        let template = BiometricTemplate {
            identity: identity.to_string(),
            descriptor,
            sample_count: sample_count.max(1),
            created_at: chrono::Local::now().naive_local(),
        };
        self.templates.upsert(template.clone())?;
        Ok(template)
    }

    pub fn enroll_template(&self, template: BiometricTemplate) -> Result<(), CoreError> {
        self.templates.upsert(template)
    }

    pub fn remove_identity(&self, identity: &str) -> bool {
        self.templates.remove(identity)
    }

    pub fn restore_attendance<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = AttendanceEvent>,
    {
        self.attendance.restore(events)
    }

    /// Retry buffered persistence events. Returns the number undelivered.
    pub fn flush(&mut self) -> usize {
        self.sink.flush()
    }

    /// Hand every buffered event to the sink, waiting for room. Call once,
    /// on shutdown. Returns the number undelivered.
    pub fn drain(&mut self) -> usize {
        self.sink.drain()
    }

    pub fn attendance(&self) -> &AttendanceStateMachine {
        &self.attendance
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn sink(&self) -> &BufferedSink<S> {
        &self.sink
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn roll_date(&mut self, date: NaiveDate) {
        if self.current_date.map_or(true, |d| d < date) {
            if self.current_date.is_some() {
                let pruned = self.attendance.prune_before(date);
                tracing::info!(%date, pruned, "new attendance day");
            }
            self.current_date = Some(date);
        }
    }
}
