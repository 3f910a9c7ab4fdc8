//! Decouples the engine thread from SQLite.
//!
//! The engine appends attendance events to a [`ChannelSink`], which never
//! blocks: a full or closed queue is reported back to the core's retry
//! buffer. An async writer task drains the queue into the database, retrying
//! each failed insert a bounded number of times.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use attendo_core::{AttendanceEvent, PersistenceSink, SinkError};
use attendo_store::{AttendanceDb, StoreError};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Non-blocking [`PersistenceSink`] in front of the writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<AttendanceEvent>,
}

impl PersistenceSink for ChannelSink {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Unavailable("writer queue full".into()),
            TrySendError::Closed(_) => SinkError::Unavailable("writer stopped".into()),
        })
    }

    /// Waits for queue space. Must not be called from inside the runtime.
    fn append_blocking(&mut self, event: &AttendanceEvent) -> Result<(), SinkError> {
        self.tx
            .blocking_send(event.clone())
            .map_err(|_| SinkError::Unavailable("writer stopped".into()))
    }
}

pub fn channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<AttendanceEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx }, rx)
}

/// Durable destination the writer task inserts into.
pub trait EventWriter: Send + Sync {
    type Error: Display + Send;

    fn write(&self, event: &AttendanceEvent) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl EventWriter for AttendanceDb {
    type Error = StoreError;

    fn write(&self, event: &AttendanceEvent) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move { self.append_event(event).await.map(|_| ()) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub dropped: u64,
}

/// Drain `rx` into `writer` until every sender is gone.
pub async fn run_writer<W: EventWriter>(
    writer: W,
    mut rx: mpsc::Receiver<AttendanceEvent>,
    policy: RetryPolicy,
) -> WriterStats {
    let mut stats = WriterStats::default();

    while let Some(event) = rx.recv().await {
        let mut attempt = 0;
        loop {
            match writer.write(&event).await {
                Ok(()) => {
                    stats.written += 1;
                    tracing::debug!(
                        identity = %event.identity,
                        punch = %event.punch,
                        "attendance event persisted"
                    );
                    break;
                }
                Err(e) if attempt < policy.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        identity = %event.identity,
                        attempt,
                        error = %e,
                        "attendance write failed; retrying"
                    );
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
                Err(e) => {
                    stats.dropped += 1;
                    tracing::error!(
                        identity = %event.identity,
                        date = %event.date,
                        punch = %event.punch,
                        timestamp = %event.timestamp,
                        error = %e,
                        "attendance event dropped after retries"
                    );
                    break;
                }
            }
        }
    }

    tracing::info!(
        written = stats.written,
        dropped = stats.dropped,
        "event writer drained"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendo_core::{LivenessVerdict, PunchType};
    use chrono::NaiveDate;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn event(identity: &str) -> AttendanceEvent {
        let timestamp = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
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

    /// Fails the first `failures` writes, then records.
    struct FlakyWriter {
        failures: AtomicU32,
        written: Mutex<Vec<String>>,
    }

    impl FlakyWriter {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl EventWriter for &FlakyWriter {
        type Error = String;

        fn write(&self, event: &AttendanceEvent) -> impl Future<Output = Result<(), String>> + Send {
            let result = if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Err("database is locked".to_string())
            } else {
                self.written.lock().unwrap().push(event.identity.clone());
                Ok(())
            };
            std::future::ready(result)
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_reports_full_queue() {
        let (mut sink, _rx) = channel(1);
        assert!(sink.append(&event("alice")).is_ok());
        assert_eq!(
            sink.append(&event("bob")),
            Err(SinkError::Unavailable("writer queue full".into()))
        );
    }

    #[tokio::test]
    async fn test_channel_sink_reports_stopped_writer() {
        let (mut sink, rx) = channel(4);
        drop(rx);
        assert_eq!(
            sink.append(&event("alice")),
            Err(SinkError::Unavailable("writer stopped".into()))
        );
    }

    #[tokio::test]
    async fn test_blocking_append_waits_for_room() {
        let (mut sink, mut rx) = channel(1);
        sink.append(&event("alice")).unwrap();

        let handoff = std::thread::spawn(move || sink.append_blocking(&event("bob")));
        assert_eq!(rx.recv().await.unwrap().identity, "alice");
        assert_eq!(rx.recv().await.unwrap().identity, "bob");
        assert!(handoff.join().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_blocking_append_fails_once_writer_is_gone() {
        let (mut sink, rx) = channel(1);
        drop(rx);
        let result = std::thread::spawn(move || sink.append_blocking(&event("alice")))
            .join()
            .unwrap();
        assert_eq!(result, Err(SinkError::Unavailable("writer stopped".into())));
    }

    #[tokio::test]
    async fn test_writer_retries_then_succeeds() {
        let writer = FlakyWriter::new(2);
        let (mut sink, rx) = channel(4);
        sink.append(&event("alice")).unwrap();
        sink.append(&event("bob")).unwrap();
        drop(sink);

        let stats = run_writer(&writer, rx, policy(3)).await;
        assert_eq!(stats, WriterStats { written: 2, dropped: 0 });
        assert_eq!(*writer.written.lock().unwrap(), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_writer_drops_after_bounded_retries() {
        let writer = FlakyWriter::new(3);
        let (mut sink, rx) = channel(4);
        sink.append(&event("alice")).unwrap();
        sink.append(&event("bob")).unwrap();
        drop(sink);

        // One attempt plus two retries uses up all three failures on alice.
        let stats = run_writer(&writer, rx, policy(2)).await;
        assert_eq!(stats, WriterStats { written: 1, dropped: 1 });
        assert_eq!(*writer.written.lock().unwrap(), ["bob"]);
    }

    #[tokio::test]
    async fn test_writer_persists_to_sqlite() {
        let db = AttendanceDb::open(Path::new(":memory:"), 4).await.unwrap();
        let (mut sink, rx) = channel(4);
        sink.append(&event("alice")).unwrap();
        drop(sink);

        let stats = run_writer(db.clone(), rx, policy(0)).await;
        assert_eq!(stats.written, 1);
        let stored = db
            .events_for_date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(stored, vec![event("alice")]);
    }
}
