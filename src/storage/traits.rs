use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Scheduling cursors persisted per uploader identifier.
///
/// Each cursor holds the absolute time at which the matching timer should
/// next fire. Absence means the timer is not armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateType {
    NextBufferUpload,
    NextBufferUploadRetry,
    NextBufferRecord,
}

impl DateType {
    pub const ALL: [DateType; 3] = [
        DateType::NextBufferRecord,
        DateType::NextBufferUpload,
        DateType::NextBufferUploadRetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DateType::NextBufferUpload => "next_buffer_upload",
            DateType::NextBufferUploadRetry => "next_buffer_upload_retry",
            DateType::NextBufferRecord => "next_buffer_record",
        }
    }
}

impl fmt::Display for DateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frozen batch of serialized records waiting in the archive FIFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBuffer {
    pub buffer_id: Uuid,
    pub archived_at: DateTime<Utc>,
    pub records: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// Id of the newly archived buffer, `None` when the current buffer was empty
    pub archived: Option<Uuid>,
    /// Number of old buffers discarded to stay within the buffer limit
    pub dropped: usize,
}

/// Opaque change-feed cursor handed out by a sample source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor(pub Vec<u8>);

impl Anchor {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Persistence contract for [`crate::batch::BatchUploader`].
///
/// All state is partitioned by the uploader identifier. Records cross this
/// boundary already serialized so the trait stays object safe.
#[async_trait]
pub trait BatchStorage: Send + Sync {
    async fn append_record(
        &self,
        identifier: &str,
        record: serde_json::Value,
    ) -> Result<(), StorageError>;

    /// Freeze the current buffer and push it onto the archive, dropping the
    /// oldest archived buffers beyond `buffer_limit`. Must be atomic with
    /// respect to `append_record`.
    async fn archive_current_buffer(
        &self,
        identifier: &str,
        buffer_limit: usize,
    ) -> Result<ArchiveOutcome, StorageError>;

    async fn oldest_archived_buffer(
        &self,
        identifier: &str,
    ) -> Result<Option<StoredBuffer>, StorageError>;

    /// Pop the archive head, but only if it is still the buffer identified by
    /// `buffer_id`. Returns whether a buffer was removed.
    async fn remove_oldest_archived_buffer(
        &self,
        identifier: &str,
        buffer_id: Uuid,
    ) -> Result<bool, StorageError>;

    async fn reset_all_buffers(&self, identifier: &str) -> Result<(), StorageError>;

    async fn current_buffer_len(&self, identifier: &str) -> Result<usize, StorageError>;

    async fn archived_buffer_count(&self, identifier: &str) -> Result<usize, StorageError>;

    async fn get_date(
        &self,
        identifier: &str,
        date_type: DateType,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn save_date(
        &self,
        identifier: &str,
        date_type: DateType,
        date: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn reset_date(&self, identifier: &str, date_type: DateType) -> Result<(), StorageError>;

    async fn get_record_interval(&self, identifier: &str)
        -> Result<Option<Duration>, StorageError>;

    async fn save_record_interval(
        &self,
        identifier: &str,
        interval: Duration,
    ) -> Result<(), StorageError>;
}

/// Persistence contract for [`crate::sequence::SequenceCoordinator`] and its
/// sub-uploaders.
#[async_trait]
pub trait SequenceStorage: Send + Sync {
    async fn last_completed_uploader(&self) -> Result<Option<String>, StorageError>;

    async fn set_last_completed_uploader(&self, key: Option<&str>) -> Result<(), StorageError>;

    async fn last_pass_completion(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn set_last_pass_completion(&self, date: DateTime<Utc>) -> Result<(), StorageError>;

    async fn last_pass_start(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn set_last_pass_start(&self, date: DateTime<Utc>) -> Result<(), StorageError>;

    async fn upload_window_start(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn set_upload_window_start(&self, date: DateTime<Utc>) -> Result<(), StorageError>;

    async fn load_anchor(&self, category: &str) -> Result<Option<Anchor>, StorageError>;

    async fn save_anchor(&self, category: &str, anchor: &Anchor) -> Result<(), StorageError>;
}
