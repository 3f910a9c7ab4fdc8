use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use attendo_core::{DetectedFace, EnrollmentConfig, EnrollmentSession};
use attendo_store::AttendanceDb;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "attendo", version, about = "Attendo attendance administration")]
struct Cli {
    /// Database path (default: $ATTENDO_DB_PATH or the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Descriptor dimension of the gallery
    #[arg(long, global = true, default_value_t = 128)]
    dim: usize,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from a JSON array of `{bbox, descriptor}` samples
    Enroll {
        identity: String,
        samples: PathBuf,
        /// Minimum accepted samples required
        #[arg(long, default_value_t = EnrollmentConfig::default().min_samples)]
        min_samples: usize,
    },
    /// List enrolled identities
    Users {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove an enrolled identity
    Remove { identity: String },
    /// Show gallery size and today's attendance
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(attendo_store::default_db_path);
    let db = AttendanceDb::open(&db_path, cli.dim)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    match cli.cmd {
        Commands::Enroll {
            identity,
            samples,
            min_samples,
        } => enroll(&db, &identity, &samples, min_samples).await,
        Commands::Users { json } => users(&db, json).await,
        Commands::Remove { identity } => {
            if !db.remove_template(&identity).await? {
                bail!("no enrolled identity named '{identity}'");
            }
            tracing::info!(identity = %identity, "template removed");
            println!("removed {identity}");
            Ok(())
        }
        Commands::Status => status(&db, &db_path).await,
    }
}

async fn enroll(db: &AttendanceDb, identity: &str, samples: &Path, min_samples: usize) -> Result<()> {
    let text = std::fs::read_to_string(samples)
        .with_context(|| format!("failed to read {}", samples.display()))?;
    let faces: Vec<DetectedFace> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of samples", samples.display()))?;

    let config = EnrollmentConfig {
        min_samples,
        max_samples: EnrollmentConfig::default().max_samples.max(min_samples),
        ..EnrollmentConfig::default()
    };
    let mut session = EnrollmentSession::new(identity, db.dimension(), config)?;
    let skipped = offer_samples(&mut session, faces);

    let template = session.finish(chrono::Local::now().naive_local())?;
    db.save_template(&template).await?;
    tracing::info!(
        identity = %template.identity,
        samples = template.sample_count,
        skipped,
        "template saved"
    );
    println!(
        "enrolled {} from {} samples",
        template.identity, template.sample_count
    );
    Ok(())
}

/// Feed samples to `session` until it is full. Returns the number skipped.
fn offer_samples(session: &mut EnrollmentSession, faces: Vec<DetectedFace>) -> usize {
    let offered = faces.len();
    let mut skipped = 0;
    for (i, face) in faces.into_iter().enumerate() {
        if session.is_full() {
            tracing::info!(ignored = offered - i, "maximum samples reached");
            break;
        }
        if let Err(e) = session.add_sample(&face.bbox, face.descriptor) {
            tracing::warn!(sample = i, error = %e, "sample skipped");
            skipped += 1;
        }
    }
    skipped
}

async fn users(db: &AttendanceDb, json: bool) -> Result<()> {
    let templates = db.list_templates().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }
    if templates.is_empty() {
        println!("no identities enrolled");
        return Ok(());
    }
    println!("{:<24} {:>5} {:>8}  CREATED", "IDENTITY", "DIM", "SAMPLES");
    for t in &templates {
        println!(
            "{:<24} {:>5} {:>8}  {}",
            t.identity, t.dimension, t.sample_count, t.created_at
        );
    }
    Ok(())
}

async fn status(db: &AttendanceDb, db_path: &Path) -> Result<()> {
    let today = chrono::Local::now().date_naive();
    let events = db.events_for_date(today).await?;

    println!("database:    {}", db_path.display());
    println!("identities:  {}", db.count_templates().await?);
    println!("events:      {}", db.count_events().await?);
    println!("today ({today}): {} events", events.len());
    for e in &events {
        println!(
            "  {}  {:<9} {:<20} confidence {:.3}",
            e.timestamp.time().format("%H:%M:%S"),
            e.punch,
            e.identity,
            e.confidence
        );
    }
    Ok(())
}
