use std::collections::VecDeque;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{LivenessVerdict, PunchType};

/// One persisted attendance transition. These six fields are the audit
/// record; encodings must preserve all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity: String,
    pub date: NaiveDate,
    pub punch: PunchType,
    pub timestamp: NaiveDateTime,
    pub confidence: f32,
    pub liveness: LivenessVerdict,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for attendance events.
///
/// `append` is called on the frame-processing path and must not block; a
/// sink that cannot accept an event right now returns
/// [`SinkError::Unavailable`].
pub trait PersistenceSink {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), SinkError>;

    /// Hand off `event`, waiting for room if the sink is momentarily full.
    /// Only called on shutdown, off the frame path. Fails only when the sink
    /// can never accept it.
    fn append_blocking(&mut self, event: &AttendanceEvent) -> Result<(), SinkError> {
        self.append(event)
    }
}

/// What happened to an appended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Held for retry on the next append or flush.
    Buffered,
}

/// Retry buffer in front of a [`PersistenceSink`].
///
/// Failed appends are queued in order and retried before any newer event is
/// sent. When the queue is full the oldest event is dropped with a warning.
pub struct BufferedSink<S> {
    inner: S,
    pending: VecDeque<AttendanceEvent>,
    capacity: usize,
    dropped: u64,
}

impl<S: PersistenceSink> BufferedSink<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn append(&mut self, event: AttendanceEvent) -> Delivery {
        self.retry_pending();

        if self.pending.is_empty() {
            match self.inner.append(&event) {
                Ok(()) => return Delivery::Delivered,
                Err(e) => {
                    tracing::warn!(
                        identity = %event.identity,
                        punch = %event.punch,
                        error = %e,
                        "attendance event not persisted; buffering for retry"
                    );
                }
            }
        }

        self.enqueue(event);
        Delivery::Buffered
    }

    /// Retry everything buffered. Returns the number still undelivered.
    pub fn flush(&mut self) -> usize {
        self.retry_pending();
        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                "attendance events still undelivered after flush"
            );
        }
        self.pending.len()
    }

    /// Hand every buffered event to the sink, waiting on each one. Used on
    /// shutdown so nothing is left behind. Returns the number undelivered.
    pub fn drain(&mut self) -> usize {
        while let Some(event) = self.pending.front() {
            if let Err(e) = self.inner.append_blocking(event) {
                tracing::error!(
                    pending = self.pending.len(),
                    error = %e,
                    "attendance events lost at shutdown"
                );
                break;
            }
            self.pending.pop_front();
        }
        self.pending.len()
    }

    /// Retry buffered events without waiting. Called once per frame so a
    /// backlog clears as soon as the sink has room.
    pub fn retry(&mut self) {
        if !self.pending.is_empty() {
            self.retry_pending();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Events discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    fn retry_pending(&mut self) {
        while let Some(event) = self.pending.front() {
            if let Err(e) = self.inner.append(event) {
                tracing::debug!(pending = self.pending.len(), error = %e, "retry deferred");
                return;
            }
            self.pending.pop_front();
        }
    }

    fn enqueue(&mut self, event: AttendanceEvent) {
        if self.pending.len() >= self.capacity {
            if let Some(oldest) = self.pending.pop_front() {
                self.dropped += 1;
                tracing::warn!(
                    identity = %oldest.identity,
                    date = %oldest.date,
                    punch = %oldest.punch,
                    "persistence buffer full; dropping oldest attendance event"
                );
            }
        }
        self.pending.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records events; fails while `down` is set. Blocking appends succeed
    /// unless `closed` is set.
    #[derive(Default)]
    struct FlakySink {
        down: bool,
        closed: bool,
        written: Vec<AttendanceEvent>,
    }

    impl PersistenceSink for FlakySink {
        fn append(&mut self, event: &AttendanceEvent) -> Result<(), SinkError> {
            if self.down {
                return Err(SinkError::Unavailable("offline".into()));
            }
            self.written.push(event.clone());
            Ok(())
        }

        fn append_blocking(&mut self, event: &AttendanceEvent) -> Result<(), SinkError> {
            if self.closed {
                return Err(SinkError::Unavailable("closed".into()));
            }
            self.written.push(event.clone());
            Ok(())
        }
    }

    fn event(identity: &str, minute: u32) -> AttendanceEvent {
        let timestamp = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, minute, 0)
            .unwrap();
        AttendanceEvent {
            identity: identity.to_string(),
            date: timestamp.date(),
            punch: PunchType::In,
            timestamp,
            confidence: 0.9,
            liveness: LivenessVerdict::Live,
        }
    }

    #[test]
    fn test_delivers_when_available() {
        let mut sink = BufferedSink::new(FlakySink::default(), 4);
        assert_eq!(sink.append(event("alice", 0)), Delivery::Delivered);
        assert_eq!(sink.inner().written.len(), 1);
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_buffers_and_retries_in_order() {
        let mut sink = BufferedSink::new(
            FlakySink {
                down: true,
                ..Default::default()
            },
            4,
        );
        assert_eq!(sink.append(event("alice", 0)), Delivery::Buffered);
        assert_eq!(sink.append(event("bob", 1)), Delivery::Buffered);
        assert_eq!(sink.pending(), 2);

        sink.inner.down = false;
        assert_eq!(sink.append(event("carol", 2)), Delivery::Delivered);
        let order: Vec<_> = sink
            .inner()
            .written
            .iter()
            .map(|e| e.identity.as_str())
            .collect();
        assert_eq!(order, ["alice", "bob", "carol"]);
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let mut sink = BufferedSink::new(
            FlakySink {
                down: true,
                ..Default::default()
            },
            2,
        );
        sink.append(event("a", 0));
        sink.append(event("b", 1));
        sink.append(event("c", 2));
        assert_eq!(sink.pending(), 2);
        assert_eq!(sink.dropped(), 1);

        sink.inner.down = false;
        assert_eq!(sink.flush(), 0);
        let order: Vec<_> = sink
            .inner()
            .written
            .iter()
            .map(|e| e.identity.as_str())
            .collect();
        assert_eq!(order, ["b", "c"]);
    }

    #[test]
    fn test_flush_reports_undelivered() {
        let mut sink = BufferedSink::new(
            FlakySink {
                down: true,
                ..Default::default()
            },
            8,
        );
        sink.append(event("alice", 0));
        assert_eq!(sink.flush(), 1);
    }

    #[test]
    fn test_drain_waits_for_every_pending_event() {
        let mut sink = BufferedSink::new(
            FlakySink {
                down: true,
                ..Default::default()
            },
            8,
        );
        sink.append(event("alice", 0));
        sink.append(event("bob", 1));
        assert_eq!(sink.flush(), 2);

        assert_eq!(sink.drain(), 0);
        let order: Vec<_> = sink
            .inner()
            .written
            .iter()
            .map(|e| e.identity.as_str())
            .collect();
        assert_eq!(order, ["alice", "bob"]);
    }

    #[test]
    fn test_drain_stops_at_closed_sink() {
        let mut sink = BufferedSink::new(
            FlakySink {
                down: true,
                closed: true,
                ..Default::default()
            },
            8,
        );
        sink.append(event("alice", 0));
        assert_eq!(sink.drain(), 1);
    }

    #[test]
    fn test_retry_clears_backlog_without_new_events() {
        let mut sink = BufferedSink::new(
            FlakySink {
                down: true,
                ..Default::default()
            },
            8,
        );
        sink.append(event("alice", 0));
        sink.retry();
        assert_eq!(sink.pending(), 1);

        sink.inner.down = false;
        sink.retry();
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.inner().written.len(), 1);
    }
}
