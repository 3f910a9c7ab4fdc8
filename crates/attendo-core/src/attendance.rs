use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::config::AttendanceConfig;
use crate::sink::AttendanceEvent;
use crate::types::{AttendanceOutcome, LivenessVerdict, MatchResult, PunchType};

/// A match that passed both the identity gates and the liveness check.
///
/// This is the only input that can move the attendance state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent {
    identity: String,
    at: NaiveDateTime,
    confidence: f32,
}

impl VerifiedEvent {
    /// `None` unless the match was accepted and the track is LIVE.
    pub fn new(result: &MatchResult, liveness: LivenessVerdict, at: NaiveDateTime) -> Option<Self> {
        if liveness != LivenessVerdict::Live {
            return None;
        }
        let identity = result.identity.clone()?;
        Some(Self {
            identity,
            at,
            confidence: result.confidence,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn at(&self) -> NaiveDateTime {
        self.at
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// One punch: when, how confident the match was, and the liveness verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Punch {
    pub at: NaiveDateTime,
    pub confidence: f32,
    pub liveness: LivenessVerdict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub punch_in: Option<Punch>,
    pub punch_out: Option<Punch>,
}

impl AttendanceRecord {
    pub fn state(&self) -> DayState {
        match (self.punch_in, self.punch_out) {
            (_, Some(_)) => DayState::PunchedOut,
            (Some(_), None) => DayState::PunchedIn,
            (None, None) => DayState::NoRecord,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    NoRecord,
    PunchedIn,
    /// Terminal for the day.
    PunchedOut,
}

/// Per (identity, date) punch-in/punch-out state with a per-identity cooldown.
///
/// An accepted event within `cooldown` of the identity's last transition is a
/// duplicate, whatever its day state. Duplicates never mutate state and never
/// extend the cooldown.
pub struct AttendanceStateMachine {
    cooldown: chrono::Duration,
    records: HashMap<(String, NaiveDate), AttendanceRecord>,
    last_transition: HashMap<String, NaiveDateTime>,
}

impl AttendanceStateMachine {
    pub fn new(config: AttendanceConfig) -> Self {
        Self {
            cooldown: config.cooldown(),
            records: HashMap::new(),
            last_transition: HashMap::new(),
        }
    }

    /// Apply a verified event. Returns `PunchIn`, `PunchOut` or `Duplicate`,
    /// plus the event to persist when the state changed.
    pub fn apply(&mut self, event: &VerifiedEvent) -> (AttendanceOutcome, Option<AttendanceEvent>) {
        let identity = event.identity();
        let at = event.at();
        let date = at.date();

        if let Some(&last) = self.last_transition.get(identity) {
            // A clock that went backwards also lands inside the window.
            if at - last < self.cooldown {
                tracing::debug!(
                    identity,
                    since_last_ms = (at - last).num_milliseconds(),
                    "accepted event inside cooldown; suppressed"
                );
                return (AttendanceOutcome::Duplicate, None);
            }
        }

        let punch = Punch {
            at,
            confidence: event.confidence(),
            liveness: LivenessVerdict::Live,
        };
        let record = self
            .records
            .entry((identity.to_string(), date))
            .or_insert_with(|| AttendanceRecord {
                identity: identity.to_string(),
                date,
                punch_in: None,
                punch_out: None,
            });

        let punch_type = match record.state() {
            DayState::NoRecord => {
                record.punch_in = Some(punch);
                PunchType::In
            }
            DayState::PunchedIn => {
                record.punch_out = Some(punch);
                PunchType::Out
            }
            DayState::PunchedOut => {
                tracing::debug!(identity, %date, "attendance already complete for the day");
                return (AttendanceOutcome::Duplicate, None);
            }
        };

        self.last_transition.insert(identity.to_string(), at);
        tracing::info!(
            identity,
            %date,
            time = %at.time(),
            confidence = event.confidence(),
            punch = %punch_type,
            "attendance recorded"
        );

        let outcome = match punch_type {
            PunchType::In => AttendanceOutcome::PunchIn,
            PunchType::Out => AttendanceOutcome::PunchOut,
        };
        let persisted = AttendanceEvent {
            identity: identity.to_string(),
            date,
            punch: punch_type,
            timestamp: at,
            confidence: event.confidence(),
            liveness: LivenessVerdict::Live,
        };
        (outcome, Some(persisted))
    }

    pub fn record(&self, identity: &str, date: NaiveDate) -> Option<&AttendanceRecord> {
        self.records.get(&(identity.to_string(), date))
    }

    pub fn state(&self, identity: &str, date: NaiveDate) -> DayState {
        self.record(identity, date)
            .map(AttendanceRecord::state)
            .unwrap_or(DayState::NoRecord)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rebuild day state from persisted events, e.g. after a restart.
    /// Events are applied in timestamp order; unmatched punch-outs create a
    /// record with only the punch-out set.
    pub fn restore<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = AttendanceEvent>,
    {
        let mut events: Vec<AttendanceEvent> = events.into_iter().collect();
        events.sort_by_key(|e| e.timestamp);

        for event in &events {
            let record = self
                .records
                .entry((event.identity.clone(), event.date))
                .or_insert_with(|| AttendanceRecord {
                    identity: event.identity.clone(),
                    date: event.date,
                    punch_in: None,
                    punch_out: None,
                });
            let punch = Punch {
                at: event.timestamp,
                confidence: event.confidence,
                liveness: event.liveness,
            };
            match event.punch {
                PunchType::In => record.punch_in = Some(punch),
                PunchType::Out => record.punch_out = Some(punch),
            }

            let last = self
                .last_transition
                .entry(event.identity.clone())
                .or_insert(event.timestamp);
            if event.timestamp > *last {
                *last = event.timestamp;
            }
        }

        tracing::info!(events = events.len(), records = self.records.len(), "attendance restored");
        events.len()
    }

    /// Drop day records older than `date`, and cooldown entries that can no
    /// longer suppress any event on or after it. Durable history lives in
    /// the sink. Returns the number of day records dropped.
    pub fn prune_before(&mut self, date: NaiveDate) -> usize {
        let before = self.records.len();
        self.records.retain(|(_, d), _| *d >= date);

        let horizon = date.and_time(NaiveTime::MIN) - self.cooldown;
        self.last_transition.retain(|_, at| *at >= horizon);
        before - self.records.len()
    }

    /// Identities whose cooldown is still tracked.
    pub fn tracked_identities(&self) -> usize {
        self.last_transition.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn verified(identity: &str, when: NaiveDateTime, confidence: f32) -> VerifiedEvent {
        let result = MatchResult {
            identity: Some(identity.to_string()),
            distance: 0.1,
            confidence,
        };
        VerifiedEvent::new(&result, LivenessVerdict::Live, when).unwrap()
    }

    fn machine() -> AttendanceStateMachine {
        AttendanceStateMachine::new(AttendanceConfig { cooldown_secs: 5 })
    }

    #[test]
    fn test_in_out_then_duplicate() {
        let mut m = machine();
        let (first, ev1) = m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        let (second, ev2) = m.apply(&verified("alice", at(1, 17, 0, 0), 0.8));
        let snapshot = m.record("alice", at(1, 0, 0, 0).date()).cloned();
        let (third, ev3) = m.apply(&verified("alice", at(1, 18, 0, 0), 0.95));

        assert_eq!(first, AttendanceOutcome::PunchIn);
        assert_eq!(second, AttendanceOutcome::PunchOut);
        assert_eq!(third, AttendanceOutcome::Duplicate);
        assert_eq!(ev1.unwrap().punch, PunchType::In);
        assert_eq!(ev2.unwrap().punch, PunchType::Out);
        assert!(ev3.is_none());

        // No mutation on the third event.
        assert_eq!(m.record("alice", at(1, 0, 0, 0).date()).cloned(), snapshot);
        let record = snapshot.unwrap();
        assert_eq!(record.punch_in.unwrap().at, at(1, 9, 0, 0));
        assert_eq!(record.punch_out.unwrap().at, at(1, 17, 0, 0));
        assert_eq!(record.punch_out.unwrap().confidence, 0.8);
    }

    #[test]
    fn test_cooldown_suppresses_second_event() {
        let mut m = machine();
        let (first, _) = m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        let (second, event) = m.apply(&verified("alice", at(1, 9, 0, 2), 0.6));

        assert_eq!(first, AttendanceOutcome::PunchIn);
        assert_eq!(second, AttendanceOutcome::Duplicate);
        assert!(event.is_none());
        assert_eq!(m.state("alice", at(1, 0, 0, 0).date()), DayState::PunchedIn);
    }

    #[test]
    fn test_duplicate_does_not_extend_cooldown() {
        let mut m = machine();
        m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        assert_eq!(
            m.apply(&verified("alice", at(1, 9, 0, 4), 0.9)).0,
            AttendanceOutcome::Duplicate
        );
        // 5 s after the transition, even though only 2 s after the duplicate.
        assert_eq!(
            m.apply(&verified("alice", at(1, 9, 0, 6), 0.9)).0,
            AttendanceOutcome::PunchOut
        );
    }

    #[test]
    fn test_cooldown_boundary_is_exclusive() {
        let mut m = machine();
        m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        assert_eq!(
            m.apply(&verified("alice", at(1, 9, 0, 5), 0.9)).0,
            AttendanceOutcome::PunchOut
        );
    }

    #[test]
    fn test_backwards_clock_is_duplicate() {
        let mut m = machine();
        m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        assert_eq!(
            m.apply(&verified("alice", at(1, 8, 0, 0), 0.9)).0,
            AttendanceOutcome::Duplicate
        );
    }

    #[test]
    fn test_identities_are_independent() {
        let mut m = machine();
        assert_eq!(
            m.apply(&verified("alice", at(1, 9, 0, 0), 0.9)).0,
            AttendanceOutcome::PunchIn
        );
        assert_eq!(
            m.apply(&verified("bob", at(1, 9, 0, 1), 0.9)).0,
            AttendanceOutcome::PunchIn
        );
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_new_day_starts_fresh() {
        let mut m = machine();
        m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        m.apply(&verified("alice", at(1, 17, 0, 0), 0.9));
        assert_eq!(
            m.apply(&verified("alice", at(2, 9, 0, 0), 0.9)).0,
            AttendanceOutcome::PunchIn
        );
    }

    #[test]
    fn test_unverified_matches_cannot_be_applied() {
        let unknown = MatchResult {
            identity: None,
            distance: 0.7,
            confidence: 0.0,
        };
        assert!(VerifiedEvent::new(&unknown, LivenessVerdict::Live, at(1, 9, 0, 0)).is_none());

        let accepted = MatchResult {
            identity: Some("alice".into()),
            distance: 0.1,
            confidence: 0.83,
        };
        for verdict in [LivenessVerdict::Spoof, LivenessVerdict::Collecting] {
            assert!(VerifiedEvent::new(&accepted, verdict, at(1, 9, 0, 0)).is_none());
        }
    }

    #[test]
    fn test_restore_resumes_day_state() {
        let mut m = machine();
        let restored = m.restore(vec![AttendanceEvent {
            identity: "alice".into(),
            date: at(1, 0, 0, 0).date(),
            punch: PunchType::In,
            timestamp: at(1, 9, 0, 0),
            confidence: 0.9,
            liveness: LivenessVerdict::Live,
        }]);
        assert_eq!(restored, 1);
        assert_eq!(m.state("alice", at(1, 0, 0, 0).date()), DayState::PunchedIn);

        // Cooldown is restored along with the record.
        assert_eq!(
            m.apply(&verified("alice", at(1, 9, 0, 3), 0.9)).0,
            AttendanceOutcome::Duplicate
        );
        assert_eq!(
            m.apply(&verified("alice", at(1, 12, 0, 0), 0.9)).0,
            AttendanceOutcome::PunchOut
        );
    }

    #[test]
    fn test_prune_before_drops_old_days() {
        let mut m = machine();
        m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        m.apply(&verified("alice", at(2, 9, 0, 0), 0.9));
        assert_eq!(m.prune_before(at(2, 0, 0, 0).date()), 1);
        assert_eq!(m.len(), 1);
        assert_eq!(m.state("alice", at(1, 0, 0, 0).date()), DayState::NoRecord);
    }

    #[test]
    fn test_prune_before_forgets_expired_cooldowns() {
        let mut m = machine();
        m.apply(&verified("alice", at(1, 9, 0, 0), 0.9));
        // Two seconds before midnight: still inside the 5 s window at 00:00.
        m.apply(&verified("bob", at(1, 23, 59, 58), 0.9));
        assert_eq!(m.tracked_identities(), 2);

        m.prune_before(at(2, 0, 0, 0).date());
        assert_eq!(m.tracked_identities(), 1);
        assert_eq!(
            m.apply(&verified("bob", at(2, 0, 0, 1), 0.9)).0,
            AttendanceOutcome::Duplicate
        );
        assert_eq!(
            m.apply(&verified("alice", at(2, 9, 0, 0), 0.9)).0,
            AttendanceOutcome::PunchIn
        );
    }
}
