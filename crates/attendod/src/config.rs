use std::path::{Path, PathBuf};
use std::time::Duration;

use attendo_core::{ConfigError, CoreConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Daemon configuration: an optional TOML file named by `ATTENDO_CONFIG`,
/// then `ATTENDO_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Thresholds handed to every core component.
    pub core: CoreConfig,
    /// Attendance events queued between the engine and the writer task.
    pub event_queue: usize,
    /// Extra attempts the writer makes for a failed insert.
    pub write_retries: u32,
    /// Base delay between write attempts; grows linearly per attempt.
    pub write_backoff: Duration,
}

/// Shape of the optional TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    db_path: Option<PathBuf>,
    core: CoreConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let file = match std::env::var("ATTENDO_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };

        let db_path = std::env::var("ATTENDO_DB_PATH")
            .map(PathBuf::from)
            .ok()
            .or(file.db_path)
            .unwrap_or_else(attendo_store::default_db_path);

        let mut core = file.core;
        core.descriptor_dim = env_usize("ATTENDO_DESCRIPTOR_DIM", core.descriptor_dim);
        core.matcher.distance_threshold =
            env_f32("ATTENDO_DISTANCE_THRESHOLD", core.matcher.distance_threshold);
        core.matcher.confidence_threshold =
            env_f32("ATTENDO_CONFIDENCE_THRESHOLD", core.matcher.confidence_threshold);
        core.liveness.history_size =
            env_usize("ATTENDO_LIVENESS_HISTORY", core.liveness.history_size);
        core.liveness.motion_pixel_threshold = env_f32(
            "ATTENDO_MOTION_PIXEL_THRESHOLD",
            core.liveness.motion_pixel_threshold,
        );
        core.liveness.intensity_delta =
            env_u8("ATTENDO_INTENSITY_DELTA", core.liveness.intensity_delta);
        core.attendance.cooldown_secs =
            env_u64("ATTENDO_COOLDOWN_SECS", core.attendance.cooldown_secs);
        core.persistence.buffer_capacity =
            env_usize("ATTENDO_BUFFER_CAPACITY", core.persistence.buffer_capacity);
        core.validate()?;

        Ok(Self {
            db_path,
            core,
            event_queue: env_usize("ATTENDO_EVENT_QUEUE", 64).max(1),
            write_retries: env_u32("ATTENDO_WRITE_RETRIES", 3),
            write_backoff: Duration::from_millis(env_u64("ATTENDO_WRITE_BACKOFF_MS", 200)),
        })
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file = parse_file(&text)?;
    tracing::info!(path = %path.display(), "configuration file loaded");
    Ok(file)
}

fn parse_file(text: &str) -> Result<FileConfig, ConfigLoadError> {
    Ok(toml::from_str(text)?)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Out-of-range values fall back to `default` rather than wrapping.
fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_u32_rejects_out_of_range() {
        std::env::set_var("ATTENDO_TEST_RETRIES_HUGE", "4294967296");
        assert_eq!(env_u32("ATTENDO_TEST_RETRIES_HUGE", 3), 3);
        std::env::set_var("ATTENDO_TEST_RETRIES_OK", "7");
        assert_eq!(env_u32("ATTENDO_TEST_RETRIES_OK", 3), 7);
        assert_eq!(env_u32("ATTENDO_TEST_RETRIES_UNSET", 3), 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = parse_file(
            r#"
            db_path = "/var/lib/attendo/attendance.db"

            [core]
            descriptor_dim = 4

            [core.attendance]
            cooldown_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(
            file.db_path.as_deref(),
            Some(Path::new("/var/lib/attendo/attendance.db"))
        );
        assert_eq!(file.core.descriptor_dim, 4);
        assert_eq!(file.core.attendance.cooldown_secs, 30);
        assert_eq!(file.core.matcher, CoreConfig::default().matcher);
        assert_eq!(file.core.liveness.history_size, 10);
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = parse_file("").unwrap();
        assert!(file.db_path.is_none());
        assert_eq!(file.core, CoreConfig::default());
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        assert!(matches!(
            parse_file("[core]\ndescriptor_dim = \"many\""),
            Err(ConfigLoadError::Toml(_))
        ));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = read_file(Path::new("/nonexistent/attendo.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/attendo.toml"));
    }
}
