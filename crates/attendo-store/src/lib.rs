//! attendo-store: SQLite persistence for Attendo.
//!
//! Holds encrypted enrollment templates (the core's `TemplateRepository`)
//! and the append-only attendance event log.

mod store;

pub use store::{AttendanceDb, StoreError, TemplateInfo};

use std::path::PathBuf;

/// Default database location: `$ATTENDO_DB_PATH`, else
/// `$XDG_DATA_HOME/attendo/attendance.db` (falling back to `~/.local/share`).
pub fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ATTENDO_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attendo")
        .join("attendance.db")
}
