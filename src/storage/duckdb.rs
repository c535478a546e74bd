use super::traits::{
    Anchor, ArchiveOutcome, BatchStorage, DateType, SequenceStorage, StorageError, StoredBuffer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const LAST_COMPLETED_UPLOADER: &str = "last_completed_uploader";
const LAST_PASS_COMPLETION: &str = "last_pass_completion";
const LAST_PASS_START: &str = "last_pass_start";
const UPLOAD_WINDOW_START: &str = "upload_window_start";

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message, e.g. "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale database file");
        }
    }
    Ok(())
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::Database(format!("invalid timestamp: {}", micros)))
}

/// DuckDB-backed storage so buffers, due-dates and anchors survive restarts.
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    /// Open (or create) the database at `path`, clearing a lock left behind
    /// by a process that is no longer running.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Database(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!(error = %error_msg, "Database lock detected");
                let pid = extract_pid_from_lock_error(&error_msg).ok_or(e)?;
                if is_process_running(pid) {
                    tracing::error!(pid = pid, "Lock holder is still running");
                    return Err(StorageError::Database(error_msg));
                }

                tracing::warn!(pid = pid, "Lock holder is gone, removing stale lock files");
                remove_lock_files(path)
                    .map_err(|io_err| StorageError::Database(io_err.to_string()))?;
                Connection::open(path)?
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS current_records (
                    identifier VARCHAR NOT NULL,
                    seq BIGINT NOT NULL,
                    record TEXT NOT NULL,
                    PRIMARY KEY (identifier, seq)
                );
                CREATE TABLE IF NOT EXISTS archived_buffers (
                    identifier VARCHAR NOT NULL,
                    seq BIGINT NOT NULL,
                    buffer_id VARCHAR NOT NULL,
                    archived_at BIGINT NOT NULL,
                    records TEXT NOT NULL,
                    PRIMARY KEY (identifier, seq)
                );
                CREATE TABLE IF NOT EXISTS uploader_dates (
                    identifier VARCHAR NOT NULL,
                    date_type VARCHAR NOT NULL,
                    due_at BIGINT NOT NULL,
                    PRIMARY KEY (identifier, date_type)
                );
                CREATE TABLE IF NOT EXISTS uploader_intervals (
                    identifier VARCHAR PRIMARY KEY,
                    interval_ns BIGINT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sequence_state (
                    key VARCHAR PRIMARY KEY,
                    text_value VARCHAR,
                    time_value BIGINT
                );
                CREATE TABLE IF NOT EXISTS sample_anchors (
                    category VARCHAR PRIMARY KEY,
                    anchor BLOB NOT NULL
                );",
            )?;
            Ok(())
        })
        .await
    }

    /// Flush the write-ahead log into the database file.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch("CHECKPOINT;")?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn state_text(&self, key: &'static str) -> Result<Option<String>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT text_value FROM sequence_state WHERE key = ?")?;
            let mut rows = stmt.query(duckdb::params![key])?;
            match rows.next()? {
                Some(row) => Ok(row.get::<_, Option<String>>(0)?),
                None => Ok(None),
            }
        })
        .await
    }

    async fn state_time(&self, key: &'static str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let micros = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT time_value FROM sequence_state WHERE key = ?")?;
                let mut rows = stmt.query(duckdb::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, Option<i64>>(0)?),
                    None => Ok(None),
                }
            })
            .await?;
        micros.map(micros_to_datetime).transpose()
    }

    async fn set_state(
        &self,
        key: &'static str,
        text: Option<String>,
        time: Option<i64>,
    ) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sequence_state (key, text_value, time_value) VALUES (?, ?, ?)",
                duckdb::params![key, text, time],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BatchStorage for DuckDbStorage {
    async fn append_record(
        &self,
        identifier: &str,
        record: serde_json::Value,
    ) -> Result<(), StorageError> {
        let identifier = identifier.to_string();
        let record = serde_json::to_string(&record)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO current_records (identifier, seq, record)
                 SELECT ?, COALESCE(MAX(seq), 0) + 1, ? FROM current_records WHERE identifier = ?",
                duckdb::params![identifier, record, identifier],
            )?;
            Ok(())
        })
        .await
    }

    async fn archive_current_buffer(
        &self,
        identifier: &str,
        buffer_limit: usize,
    ) -> Result<ArchiveOutcome, StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let records = {
                let mut stmt = tx.prepare(
                    "SELECT record FROM current_records WHERE identifier = ? ORDER BY seq",
                )?;
                let mut rows = stmt.query(duckdb::params![identifier])?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    records.push(serde_json::from_str::<serde_json::Value>(&raw)?);
                }
                records
            };

            if records.is_empty() {
                return Ok(ArchiveOutcome::default());
            }

            let buffer_id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO archived_buffers (identifier, seq, buffer_id, archived_at, records)
                 SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ? FROM archived_buffers WHERE identifier = ?",
                duckdb::params![
                    identifier,
                    buffer_id.to_string(),
                    Utc::now().timestamp_micros(),
                    serde_json::to_string(&records)?,
                    identifier,
                ],
            )?;
            tx.execute(
                "DELETE FROM current_records WHERE identifier = ?",
                duckdb::params![identifier],
            )?;

            let count: i64 = {
                let mut stmt =
                    tx.prepare("SELECT COUNT(*) FROM archived_buffers WHERE identifier = ?")?;
                let mut rows = stmt.query(duckdb::params![identifier])?;
                match rows.next()? {
                    Some(row) => row.get(0)?,
                    None => 0,
                }
            };

            let excess = (count - buffer_limit as i64).max(0);
            if excess > 0 {
                tx.execute(
                    &format!(
                        "DELETE FROM archived_buffers WHERE identifier = ? AND seq IN (
                            SELECT seq FROM archived_buffers WHERE identifier = ? ORDER BY seq LIMIT {}
                        )",
                        excess
                    ),
                    duckdb::params![identifier, identifier],
                )?;
            }

            tx.commit()?;

            Ok(ArchiveOutcome {
                archived: Some(buffer_id),
                dropped: excess as usize,
            })
        })
        .await
    }

    async fn oldest_archived_buffer(
        &self,
        identifier: &str,
    ) -> Result<Option<StoredBuffer>, StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT buffer_id, archived_at, records FROM archived_buffers
                 WHERE identifier = ? ORDER BY seq LIMIT 1",
            )?;
            let mut rows = stmt.query(duckdb::params![identifier])?;

            let Some(row) = rows.next()? else {
                return Ok(None);
            };

            let buffer_id: String = row.get(0)?;
            let archived_at: i64 = row.get(1)?;
            let records: String = row.get(2)?;

            Ok(Some(StoredBuffer {
                buffer_id: Uuid::parse_str(&buffer_id)
                    .map_err(|e| StorageError::Database(format!("invalid buffer id: {}", e)))?,
                archived_at: micros_to_datetime(archived_at)?,
                records: serde_json::from_str(&records)?,
            }))
        })
        .await
    }

    async fn remove_oldest_archived_buffer(
        &self,
        identifier: &str,
        buffer_id: Uuid,
    ) -> Result<bool, StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM archived_buffers WHERE identifier = ? AND buffer_id = ? AND seq = (
                    SELECT MIN(seq) FROM archived_buffers WHERE identifier = ?
                )",
                duckdb::params![identifier, buffer_id.to_string(), identifier],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn reset_all_buffers(&self, identifier: &str) -> Result<(), StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM current_records WHERE identifier = ?",
                duckdb::params![identifier],
            )?;
            tx.execute(
                "DELETE FROM archived_buffers WHERE identifier = ?",
                duckdb::params![identifier],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn current_buffer_len(&self, identifier: &str) -> Result<usize, StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM current_records WHERE identifier = ?")?;
            let mut rows = stmt.query(duckdb::params![identifier])?;
            let count: i64 = match rows.next()? {
                Some(row) => row.get(0)?,
                None => 0,
            };
            Ok(count as usize)
        })
        .await
    }

    async fn archived_buffer_count(&self, identifier: &str) -> Result<usize, StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM archived_buffers WHERE identifier = ?")?;
            let mut rows = stmt.query(duckdb::params![identifier])?;
            let count: i64 = match rows.next()? {
                Some(row) => row.get(0)?,
                None => 0,
            };
            Ok(count as usize)
        })
        .await
    }

    async fn get_date(
        &self,
        identifier: &str,
        date_type: DateType,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let identifier = identifier.to_string();
        let micros = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT due_at FROM uploader_dates WHERE identifier = ? AND date_type = ?",
                )?;
                let mut rows = stmt.query(duckdb::params![identifier, date_type.as_str()])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, i64>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        micros.map(micros_to_datetime).transpose()
    }

    async fn save_date(
        &self,
        identifier: &str,
        date_type: DateType,
        date: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO uploader_dates (identifier, date_type, due_at) VALUES (?, ?, ?)",
                duckdb::params![identifier, date_type.as_str(), date.timestamp_micros()],
            )?;
            Ok(())
        })
        .await
    }

    async fn reset_date(&self, identifier: &str, date_type: DateType) -> Result<(), StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM uploader_dates WHERE identifier = ? AND date_type = ?",
                duckdb::params![identifier, date_type.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_record_interval(
        &self,
        identifier: &str,
    ) -> Result<Option<Duration>, StorageError> {
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT interval_ns FROM uploader_intervals WHERE identifier = ?")?;
            let mut rows = stmt.query(duckdb::params![identifier])?;
            match rows.next()? {
                Some(row) => {
                    let nanos: i64 = row.get(0)?;
                    Ok(Some(Duration::from_nanos(nanos.max(0) as u64)))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_record_interval(
        &self,
        identifier: &str,
        interval: Duration,
    ) -> Result<(), StorageError> {
        let identifier = identifier.to_string();
        // Whole nanoseconds, so a saved interval compares equal to the one passed in
        let nanos = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO uploader_intervals (identifier, interval_ns) VALUES (?, ?)",
                duckdb::params![identifier, nanos],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SequenceStorage for DuckDbStorage {
    async fn last_completed_uploader(&self) -> Result<Option<String>, StorageError> {
        self.state_text(LAST_COMPLETED_UPLOADER).await
    }

    async fn set_last_completed_uploader(&self, key: Option<&str>) -> Result<(), StorageError> {
        self.set_state(LAST_COMPLETED_UPLOADER, key.map(str::to_string), None)
            .await
    }

    async fn last_pass_completion(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.state_time(LAST_PASS_COMPLETION).await
    }

    async fn set_last_pass_completion(&self, date: DateTime<Utc>) -> Result<(), StorageError> {
        self.set_state(LAST_PASS_COMPLETION, None, Some(date.timestamp_micros()))
            .await
    }

    async fn last_pass_start(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.state_time(LAST_PASS_START).await
    }

    async fn set_last_pass_start(&self, date: DateTime<Utc>) -> Result<(), StorageError> {
        self.set_state(LAST_PASS_START, None, Some(date.timestamp_micros()))
            .await
    }

    async fn upload_window_start(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.state_time(UPLOAD_WINDOW_START).await
    }

    async fn set_upload_window_start(&self, date: DateTime<Utc>) -> Result<(), StorageError> {
        self.set_state(UPLOAD_WINDOW_START, None, Some(date.timestamp_micros()))
            .await
    }

    async fn load_anchor(&self, category: &str) -> Result<Option<Anchor>, StorageError> {
        let category = category.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT anchor FROM sample_anchors WHERE category = ?")?;
            let mut rows = stmt.query(duckdb::params![category])?;
            match rows.next()? {
                Some(row) => Ok(Some(Anchor(row.get::<_, Vec<u8>>(0)?))),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_anchor(&self, category: &str, anchor: &Anchor) -> Result<(), StorageError> {
        let category = category.to_string();
        let bytes = anchor.0.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sample_anchors (category, anchor) VALUES (?, ?)",
                duckdb::params![category, bytes],
            )?;
            Ok(())
        })
        .await
    }
}
