use super::traits::{
    Anchor, ArchiveOutcome, BatchStorage, DateType, SequenceStorage, StorageError, StoredBuffer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// In-process storage. Nothing survives the process, so it is mostly useful
/// for tests and for running without a database.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    uploaders: HashMap<String, UploaderState>,
    last_completed_uploader: Option<String>,
    last_pass_completion: Option<DateTime<Utc>>,
    last_pass_start: Option<DateTime<Utc>>,
    upload_window_start: Option<DateTime<Utc>>,
    anchors: HashMap<String, Anchor>,
}

#[derive(Debug, Default)]
struct UploaderState {
    current: Vec<serde_json::Value>,
    archived: VecDeque<StoredBuffer>,
    dates: HashMap<DateType, DateTime<Utc>>,
    record_interval: Option<Duration>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    fn with_uploader<T>(
        &self,
        identifier: &str,
        f: impl FnOnce(&mut UploaderState) -> T,
    ) -> Result<T, StorageError> {
        let mut inner = self.lock()?;
        let state = inner.uploaders.entry(identifier.to_string()).or_default();
        Ok(f(state))
    }
}

#[async_trait]
impl BatchStorage for MemoryStorage {
    async fn append_record(
        &self,
        identifier: &str,
        record: serde_json::Value,
    ) -> Result<(), StorageError> {
        self.with_uploader(identifier, |state| state.current.push(record))
    }

    async fn archive_current_buffer(
        &self,
        identifier: &str,
        buffer_limit: usize,
    ) -> Result<ArchiveOutcome, StorageError> {
        self.with_uploader(identifier, |state| {
            if state.current.is_empty() {
                return ArchiveOutcome::default();
            }

            let buffer = StoredBuffer {
                buffer_id: Uuid::new_v4(),
                archived_at: Utc::now(),
                records: std::mem::take(&mut state.current),
            };
            let archived = Some(buffer.buffer_id);
            state.archived.push_back(buffer);

            let mut dropped = 0;
            while state.archived.len() > buffer_limit {
                state.archived.pop_front();
                dropped += 1;
            }

            ArchiveOutcome { archived, dropped }
        })
    }

    async fn oldest_archived_buffer(
        &self,
        identifier: &str,
    ) -> Result<Option<StoredBuffer>, StorageError> {
        self.with_uploader(identifier, |state| state.archived.front().cloned())
    }

    async fn remove_oldest_archived_buffer(
        &self,
        identifier: &str,
        buffer_id: Uuid,
    ) -> Result<bool, StorageError> {
        self.with_uploader(identifier, |state| {
            match state.archived.front() {
                Some(head) if head.buffer_id == buffer_id => {
                    state.archived.pop_front();
                    true
                }
                _ => false,
            }
        })
    }

    async fn reset_all_buffers(&self, identifier: &str) -> Result<(), StorageError> {
        self.with_uploader(identifier, |state| {
            state.current.clear();
            state.archived.clear();
        })
    }

    async fn current_buffer_len(&self, identifier: &str) -> Result<usize, StorageError> {
        self.with_uploader(identifier, |state| state.current.len())
    }

    async fn archived_buffer_count(&self, identifier: &str) -> Result<usize, StorageError> {
        self.with_uploader(identifier, |state| state.archived.len())
    }

    async fn get_date(
        &self,
        identifier: &str,
        date_type: DateType,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.with_uploader(identifier, |state| state.dates.get(&date_type).copied())
    }

    async fn save_date(
        &self,
        identifier: &str,
        date_type: DateType,
        date: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.with_uploader(identifier, |state| {
            state.dates.insert(date_type, date);
        })
    }

    async fn reset_date(&self, identifier: &str, date_type: DateType) -> Result<(), StorageError> {
        self.with_uploader(identifier, |state| {
            state.dates.remove(&date_type);
        })
    }

    async fn get_record_interval(
        &self,
        identifier: &str,
    ) -> Result<Option<Duration>, StorageError> {
        self.with_uploader(identifier, |state| state.record_interval)
    }

    async fn save_record_interval(
        &self,
        identifier: &str,
        interval: Duration,
    ) -> Result<(), StorageError> {
        self.with_uploader(identifier, |state| state.record_interval = Some(interval))
    }
}

#[async_trait]
impl SequenceStorage for MemoryStorage {
    async fn last_completed_uploader(&self) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.last_completed_uploader.clone())
    }

    async fn set_last_completed_uploader(&self, key: Option<&str>) -> Result<(), StorageError> {
        self.lock()?.last_completed_uploader = key.map(str::to_string);
        Ok(())
    }

    async fn last_pass_completion(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.lock()?.last_pass_completion)
    }

    async fn set_last_pass_completion(&self, date: DateTime<Utc>) -> Result<(), StorageError> {
        self.lock()?.last_pass_completion = Some(date);
        Ok(())
    }

    async fn last_pass_start(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.lock()?.last_pass_start)
    }

    async fn set_last_pass_start(&self, date: DateTime<Utc>) -> Result<(), StorageError> {
        self.lock()?.last_pass_start = Some(date);
        Ok(())
    }

    async fn upload_window_start(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.lock()?.upload_window_start)
    }

    async fn set_upload_window_start(&self, date: DateTime<Utc>) -> Result<(), StorageError> {
        self.lock()?.upload_window_start = Some(date);
        Ok(())
    }

    async fn load_anchor(&self, category: &str) -> Result<Option<Anchor>, StorageError> {
        Ok(self.lock()?.anchors.get(category).cloned())
    }

    async fn save_anchor(&self, category: &str, anchor: &Anchor) -> Result<(), StorageError> {
        self.lock()?
            .anchors
            .insert(category.to_string(), anchor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_archive_moves_current_buffer() {
        let storage = MemoryStorage::new();
        storage.append_record("device", json!(1)).await.unwrap();
        storage.append_record("device", json!(2)).await.unwrap();

        let outcome = storage.archive_current_buffer("device", 10).await.unwrap();
        assert!(outcome.archived.is_some());
        assert_eq!(outcome.dropped, 0);

        assert_eq!(storage.current_buffer_len("device").await.unwrap(), 0);
        let oldest = storage.oldest_archived_buffer("device").await.unwrap().unwrap();
        assert_eq!(oldest.records, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_archive_empty_buffer_is_noop() {
        let storage = MemoryStorage::new();
        let outcome = storage.archive_current_buffer("device", 10).await.unwrap();
        assert_eq!(outcome, ArchiveOutcome::default());
        assert_eq!(storage.archived_buffer_count("device").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_buffer_limit_drops_oldest() {
        let storage = MemoryStorage::new();
        for i in 0..4 {
            storage.append_record("device", json!(i)).await.unwrap();
            storage.archive_current_buffer("device", 3).await.unwrap();
        }

        assert_eq!(storage.archived_buffer_count("device").await.unwrap(), 3);
        let oldest = storage.oldest_archived_buffer("device").await.unwrap().unwrap();
        assert_eq!(oldest.records, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_remove_requires_matching_head() {
        let storage = MemoryStorage::new();
        storage.append_record("device", json!("a")).await.unwrap();
        storage.archive_current_buffer("device", 10).await.unwrap();

        assert!(!storage
            .remove_oldest_archived_buffer("device", Uuid::new_v4())
            .await
            .unwrap());

        let head = storage.oldest_archived_buffer("device").await.unwrap().unwrap();
        assert!(storage
            .remove_oldest_archived_buffer("device", head.buffer_id)
            .await
            .unwrap());
        assert_eq!(storage.archived_buffer_count("device").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_is_partitioned_by_identifier() {
        let storage = MemoryStorage::new();
        storage.append_record("a", json!(1)).await.unwrap();
        storage
            .save_date("a", DateType::NextBufferRecord, Utc::now())
            .await
            .unwrap();

        assert_eq!(storage.current_buffer_len("b").await.unwrap(), 0);
        assert!(storage
            .get_date("b", DateType::NextBufferRecord)
            .await
            .unwrap()
            .is_none());
    }
}
