use super::category::HealthDataType;
use super::source::{SampleSource, SourceError};
use crate::network::UploadError;
use crate::storage::SequenceStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SampleUploadError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("category '{0}' is not backed by samples")]
    UnexpectedDataType(HealthDataType),

    #[error("failed to fetch samples: {0}")]
    FetchData(#[source] SourceError),

    #[error("permission denied reading samples: {0}")]
    PermissionDenied(#[source] SourceError),

    #[error("upload rejected by server: {0}")]
    UploadServer(#[source] UploadError),

    #[error("upload failed, backend unreachable: {0}")]
    UploadConnectivity(String),
}

impl SampleUploadError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SampleUploadError::UploadConnectivity(_))
    }
}

impl From<UploadError> for SampleUploadError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Connectivity(message) => SampleUploadError::UploadConnectivity(message),
            other => SampleUploadError::UploadServer(other),
        }
    }
}

impl From<SourceError> for SampleUploadError {
    fn from(e: SourceError) -> Self {
        if e.is_permission_denied() {
            SampleUploadError::PermissionDenied(e)
        } else {
            SampleUploadError::FetchData(e)
        }
    }
}

/// Samples of one category, ready to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePayload {
    pub category: HealthDataType,
    pub samples: Vec<serde_json::Value>,
}

impl SamplePayload {
    /// Wire shape: the samples keyed by category name.
    pub fn to_json(&self) -> serde_json::Value {
        let mut data = serde_json::Map::new();
        data.insert(
            self.category.key_name().to_string(),
            serde_json::Value::Array(self.samples.clone()),
        );
        serde_json::Value::Object(data)
    }
}

/// Remote sink for health samples.
#[async_trait]
pub trait SampleNetwork: Send + Sync {
    async fn upload_health_data(
        &self,
        payload: &SamplePayload,
        source: &str,
    ) -> Result<(), UploadError>;
}

/// One unit of a sequence pass. The key is persisted as the resume cursor, so
/// it must be stable across restarts and unique within a coordinator.
#[async_trait]
pub trait LogicalUploader: Send + Sync {
    fn key(&self) -> &str;

    async fn run(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), SampleUploadError>;
}

/// Uploads the samples of one category for a time window, checkpointing the
/// source anchor only after the backend has accepted them.
pub struct SampleUploader {
    category: HealthDataType,
    source_tag: String,
    storage: Arc<dyn SequenceStorage>,
    source: Arc<dyn SampleSource>,
    network: Option<Arc<dyn SampleNetwork>>,
}

impl SampleUploader {
    pub fn new(
        category: HealthDataType,
        source_tag: impl Into<String>,
        storage: Arc<dyn SequenceStorage>,
        source: Arc<dyn SampleSource>,
    ) -> Self {
        Self {
            category,
            source_tag: source_tag.into(),
            storage,
            source,
            network: None,
        }
    }

    pub fn with_network(mut self, network: Arc<dyn SampleNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn set_network(&mut self, network: Arc<dyn SampleNetwork>) {
        self.network = Some(network);
    }

    pub fn category(&self) -> HealthDataType {
        self.category
    }
}

#[async_trait]
impl LogicalUploader for SampleUploader {
    fn key(&self) -> &str {
        self.category.key_name()
    }

    async fn run(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), SampleUploadError> {
        if !self.category.is_sample_backed() {
            return Err(SampleUploadError::UnexpectedDataType(self.category));
        }

        let network = self
            .network
            .as_ref()
            .ok_or_else(|| SampleUploadError::Internal("no network sink configured".to_string()))?;

        let key = self.category.key_name();
        let anchor = self
            .storage
            .load_anchor(key)
            .await
            .map_err(|e| SampleUploadError::Internal(e.to_string()))?;

        let batch = self.source.query(self.category, start, end, anchor).await?;
        tracing::debug!(
            category = %self.category,
            samples = batch.samples.len(),
            start = %start,
            end = %end,
            "Fetched samples"
        );

        if !batch.samples.is_empty() {
            let payload = SamplePayload {
                category: self.category,
                samples: batch.samples,
            };
            network.upload_health_data(&payload, &self.source_tag).await?;
        }

        self.storage
            .save_anchor(key, &batch.anchor)
            .await
            .map_err(|e| SampleUploadError::Internal(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::source::SampleBatch;
    use crate::storage::{Anchor, MemoryStorage};
    use std::sync::Mutex;

    struct FixedSource {
        batch: SampleBatch,
    }

    #[async_trait]
    impl SampleSource for FixedSource {
        async fn query(
            &self,
            _category: HealthDataType,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _anchor: Option<Anchor>,
        ) -> Result<SampleBatch, SourceError> {
            Ok(self.batch.clone())
        }
    }

    #[derive(Default)]
    struct RecordingNetwork {
        uploads: Mutex<Vec<(SamplePayload, String)>>,
    }

    #[async_trait]
    impl SampleNetwork for RecordingNetwork {
        async fn upload_health_data(
            &self,
            payload: &SamplePayload,
            source: &str,
        ) -> Result<(), UploadError> {
            self.uploads
                .lock()
                .unwrap()
                .push((payload.clone(), source.to_string()));
            Ok(())
        }
    }

    struct FailingNetwork(UploadError);

    #[async_trait]
    impl SampleNetwork for FailingNetwork {
        async fn upload_health_data(
            &self,
            _payload: &SamplePayload,
            _source: &str,
        ) -> Result<(), UploadError> {
            Err(self.0.clone())
        }
    }

    fn uploader(
        category: HealthDataType,
        samples: Vec<serde_json::Value>,
        storage: Arc<MemoryStorage>,
    ) -> SampleUploader {
        let source = Arc::new(FixedSource {
            batch: SampleBatch {
                anchor: Anchor(vec![7]),
                samples,
            },
        });
        SampleUploader::new(category, "test-device", storage, source)
    }

    #[tokio::test]
    async fn test_uploads_then_saves_anchor() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(RecordingNetwork::default());
        let uploader = uploader(
            HealthDataType::StepCount,
            vec![serde_json::json!({ "value": 1 })],
            storage.clone(),
        )
        .with_network(network.clone());

        uploader.run(Utc::now(), Utc::now()).await.unwrap();

        let uploads = network.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, "test-device");
        assert_eq!(
            uploads[0].0.to_json(),
            serde_json::json!({ "stepCount": [{ "value": 1 }] })
        );
        assert_eq!(
            storage.load_anchor("stepCount").await.unwrap(),
            Some(Anchor(vec![7]))
        );
    }

    #[tokio::test]
    async fn test_empty_batch_advances_anchor_without_upload() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(RecordingNetwork::default());
        let uploader = uploader(HealthDataType::HeartRate, vec![], storage.clone())
            .with_network(network.clone());

        uploader.run(Utc::now(), Utc::now()).await.unwrap();

        assert!(network.uploads.lock().unwrap().is_empty());
        assert_eq!(
            storage.load_anchor("heartRate").await.unwrap(),
            Some(Anchor(vec![7]))
        );
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_anchor() {
        let storage = Arc::new(MemoryStorage::new());
        let uploader = uploader(
            HealthDataType::HeartRate,
            vec![serde_json::json!({ "value": 60 })],
            storage.clone(),
        )
        .with_network(Arc::new(FailingNetwork(UploadError::Connectivity(
            "offline".to_string(),
        ))));

        let err = uploader.run(Utc::now(), Utc::now()).await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(storage.load_anchor("heartRate").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_is_not_connectivity() {
        let storage = Arc::new(MemoryStorage::new());
        let uploader = uploader(
            HealthDataType::HeartRate,
            vec![serde_json::json!({ "value": 60 })],
            storage,
        )
        .with_network(Arc::new(FailingNetwork(UploadError::Server {
            status: 422,
            message: "bad payload".to_string(),
        })));

        let err = uploader.run(Utc::now(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, SampleUploadError::UploadServer(_)));
    }

    #[tokio::test]
    async fn test_characteristic_category_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let uploader = uploader(HealthDataType::BloodType, vec![], storage)
            .with_network(Arc::new(RecordingNetwork::default()));

        let err = uploader.run(Utc::now(), Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            SampleUploadError::UnexpectedDataType(HealthDataType::BloodType)
        ));
    }

    #[tokio::test]
    async fn test_missing_network_is_internal_error() {
        let storage = Arc::new(MemoryStorage::new());
        let uploader = uploader(HealthDataType::StepCount, vec![], storage);

        let err = uploader.run(Utc::now(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, SampleUploadError::Internal(_)));
    }
}
