use std::future::Future;
use std::path::Path;

use attendo_core::{
    AttendanceEvent, BiometricTemplate, CoreError, Descriptor, LivenessVerdict, PunchType,
    TemplateRepository,
};
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("invalid stored {column}: {value:?}")]
    InvalidColumn { column: &'static str, value: String },
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed template and attendance storage.
///
/// Descriptors are encrypted with AES-256-GCM before storage. A
/// per-installation 32-byte key is generated at first use and kept at
/// `{db_dir}/.key` (mode 0600). Attendance events are stored in the clear:
/// they are the audit log and must stay readable by reporting tools.
#[derive(Clone)]
pub struct AttendanceDb {
    conn: Connection,
    enc_key: [u8; 32],
    dimension: usize,
}

impl AttendanceDb {
    /// Open (or create) the database at `db_path` for descriptors of
    /// `dimension` values and run migrations.
    pub async fn open(db_path: &Path, dimension: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS templates (
                     identity TEXT PRIMARY KEY,
                     descriptor BLOB NOT NULL,
                     dimension INTEGER NOT NULL,
                     sample_count INTEGER NOT NULL DEFAULT 1,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance_events (
                     id TEXT PRIMARY KEY,
                     identity TEXT NOT NULL,
                     date TEXT NOT NULL,
                     punch_type TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     confidence REAL NOT NULL,
                     liveness TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_events_date ON attendance_events(date);
                 CREATE INDEX IF NOT EXISTS idx_events_identity ON attendance_events(identity);",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), dimension, "database opened");
        Ok(Self {
            conn,
            enc_key,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    // ── Templates ─────────────────────────────────────────────────────────────

    /// Insert or replace the template for `template.identity`.
    pub async fn save_template(&self, template: &BiometricTemplate) -> Result<(), StoreError> {
        if template.identity.trim().is_empty() {
            return Err(CoreError::EmptyIdentity.into());
        }
        template.descriptor.validate(self.dimension)?;

        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_descriptor(template.descriptor.values())?;
        let identity = template.identity.clone();
        let dimension = template.descriptor.dim() as i64;
        let sample_count = template.sample_count as i64;
        let created_at = template.created_at.format(TIMESTAMP_FORMAT).to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO templates (identity, descriptor, dimension, sample_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(identity) DO UPDATE SET
                         descriptor = excluded.descriptor,
                         dimension = excluded.dimension,
                         sample_count = excluded.sample_count,
                         created_at = excluded.created_at",
                    rusqlite::params![identity, blob, dimension, sample_count, created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(identity = %template.identity, "template saved");
        Ok(())
    }

    /// All stored templates. Rows are decoded with their own stored
    /// dimension; callers decide what to do with mismatches.
    pub async fn load_templates(&self) -> Result<Vec<BiometricTemplate>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, Vec<u8>, i64, i64, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity, descriptor, dimension, sample_count, created_at
                     FROM templates ORDER BY identity",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut templates = Vec::with_capacity(rows.len());
        for (identity, blob, dimension, sample_count, created_at) in rows {
            let values = self.decrypt_descriptor(&blob, dimension as usize)?;
            templates.push(BiometricTemplate {
                identity,
                descriptor: Descriptor::new(values),
                sample_count: sample_count.max(0) as usize,
                created_at: parse_timestamp("created_at", &created_at)?,
            });
        }
        Ok(templates)
    }

    /// Metadata for every enrolled identity (no descriptor data).
    pub async fn list_templates(&self) -> Result<Vec<TemplateInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity, dimension, sample_count, created_at
                     FROM templates ORDER BY identity",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(TemplateInfo {
                        identity: row.get(0)?,
                        dimension: row.get(1)?,
                        sample_count: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn remove_template(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let affected =
                    conn.execute("DELETE FROM templates WHERE identity = ?1", [&identity])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_templates(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM templates", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Attendance events ─────────────────────────────────────────────────────

    /// Append one attendance event. Returns the generated UUID.
    pub async fn append_event(&self, event: &AttendanceEvent) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let identity = event.identity.clone();
        let date = event.date.format(DATE_FORMAT).to_string();
        let punch = event.punch.as_str();
        let timestamp = event.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let confidence = f64::from(event.confidence);
        let liveness = event.liveness.as_str();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_events (id, identity, date, punch_type, timestamp, confidence, liveness)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id_clone, identity, date, punch, timestamp, confidence, liveness],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Events recorded for `date`, oldest first.
    pub async fn events_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
        let date = date.format(DATE_FORMAT).to_string();
        let rows: Vec<EventRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity, date, punch_type, timestamp, confidence, liveness
                     FROM attendance_events WHERE date = ?1 ORDER BY timestamp",
                )?;
                let rows = stmt.query_map([&date], |row| {
                    Ok(EventRow {
                        identity: row.get(0)?,
                        date: row.get(1)?,
                        punch: row.get(2)?,
                        timestamp: row.get(3)?,
                        confidence: row.get(4)?,
                        liveness: row.get(5)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub async fn count_events(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance_events",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidDescriptorValue);
        }
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor_strict(&plaintext, dimension)
    }
}

impl TemplateRepository for AttendanceDb {
    type Error = StoreError;

    fn load(&self) -> impl Future<Output = Result<Vec<BiometricTemplate>, StoreError>> + Send {
        self.load_templates()
    }

    fn save(
        &self,
        template: &BiometricTemplate,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.save_template(template)
    }
}

/// Raw `attendance_events` row before column validation.
struct EventRow {
    identity: String,
    date: String,
    punch: String,
    timestamp: String,
    confidence: f64,
    liveness: String,
}

impl EventRow {
    fn into_event(self) -> Result<AttendanceEvent, StoreError> {
        let punch = PunchType::parse(&self.punch).ok_or(StoreError::InvalidColumn {
            column: "punch_type",
            value: self.punch.clone(),
        })?;
        let liveness = LivenessVerdict::parse(&self.liveness).ok_or(StoreError::InvalidColumn {
            column: "liveness",
            value: self.liveness.clone(),
        })?;
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT).map_err(|_| {
            StoreError::InvalidColumn {
                column: "date",
                value: self.date.clone(),
            }
        })?;
        Ok(AttendanceEvent {
            identity: self.identity,
            date,
            punch,
            timestamp: parse_timestamp("timestamp", &self.timestamp)?,
            confidence: self.confidence as f32,
            liveness,
        })
    }
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|_| StoreError::InvalidColumn {
        column,
        value: value.to_string(),
    })
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_descriptor_strict(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != dimension * 4 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(dimension);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidDescriptorValue);
        }
        values.push(v);
    }
    Ok(values)
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an enrolled identity (no descriptor data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TemplateInfo {
    pub identity: String,
    pub dimension: u32,
    pub sample_count: u32,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
