use std::sync::Arc;

use anyhow::{Context, Result};
use attendo_core::{Descriptor, Orchestrator, TemplateStore};
use attendo_store::AttendanceDb;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod feed;
mod persistence;

use config::Config;
use engine::EngineHandle;
use feed::{FeedMessage, FeedReply};
use persistence::RetryPolicy;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the outcome stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("attendod starting");

    let config = Config::from_env().context("invalid configuration")?;
    let dimension = config.core.descriptor_dim;

    let db = AttendanceDb::open(&config.db_path, dimension)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let templates = Arc::new(TemplateStore::new(dimension));
    let loaded = templates
        .load_from(&db)
        .await
        .context("failed to load templates")?;

    let (sink, events) = persistence::channel(config.event_queue);
    let writer = tokio::spawn(persistence::run_writer(
        db.clone(),
        events,
        RetryPolicy {
            max_retries: config.write_retries,
            backoff: config.write_backoff,
        },
    ));

    let mut orchestrator = Orchestrator::new(&config.core, templates, sink);
    let today = chrono::Local::now().date_naive();
    let restored = orchestrator.restore_attendance(
        db.events_for_date(today)
            .await
            .context("failed to restore today's attendance")?,
    );

    let engine = engine::spawn_engine(orchestrator)?;
    tracing::info!(
        db = %config.db_path.display(),
        templates = loaded,
        restored,
        "attendod ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read frame feed")? else {
                    tracing::info!("frame feed closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = dispatch(&engine, &db, &line).await;
                stdout.write_all(reply.to_line().as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            _ = &mut interrupt => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    tracing::info!("attendod shutting down");
    let undelivered = engine.shutdown().await?;
    if undelivered > 0 {
        tracing::warn!(undelivered, "attendance events lost at shutdown");
    }
    drop(engine);

    let stats = writer.await.context("event writer task failed")?;
    tracing::info!(
        written = stats.written,
        dropped = stats.dropped,
        "attendod stopped"
    );
    Ok(())
}

/// Handle one feed line. Every line yields exactly one reply; failures are
/// reported on the stream and never stop the loop.
async fn dispatch(engine: &EngineHandle, db: &AttendanceDb, line: &str) -> FeedReply {
    let message = match FeedMessage::parse(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "rejected feed line");
            return FeedReply::error(e);
        }
    };

    match message {
        FeedMessage::Frame(frame) => {
            let frame = match frame.into_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "rejected frame");
                    return FeedReply::error(e);
                }
            };
            match engine.recognize(frame).await {
                Ok(outcome) => FeedReply::Outcome(outcome),
                Err(e) => {
                    tracing::warn!(error = %e, "frame not processed");
                    FeedReply::error(e)
                }
            }
        }
        FeedMessage::ResetLiveness { track_id } => match engine.reset_liveness(track_id).await {
            Ok(()) => FeedReply::LivenessReset { track_id },
            Err(e) => FeedReply::error(e),
        },
        FeedMessage::Enroll {
            identity,
            descriptor,
            sample_count,
        } => {
            let sample_count = sample_count.unwrap_or(1);
            let template = match engine
                .enroll(identity, Descriptor::new(descriptor), sample_count)
                .await
            {
                Ok(template) => template,
                Err(e) => {
                    tracing::warn!(error = %e, "enroll rejected");
                    return FeedReply::error(e);
                }
            };
            if let Err(e) = db.save_template(&template).await {
                tracing::error!(identity = %template.identity, error = %e, "enroll: store write failed");
                return FeedReply::error(format!(
                    "enrolled for this session but not persisted: {e}"
                ));
            }
            FeedReply::Enrolled {
                dimension: template.descriptor.dim(),
                identity: template.identity,
            }
        }
    }
}
