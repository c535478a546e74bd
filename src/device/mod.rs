use crate::batch::{BatchUploader, Buffer};
use crate::network::{ApiClient, UploadError};
use async_trait::async_trait;
use chrono::{Local, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One periodic device telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// SHA-256 of the host name, hex encoded
    pub hashed_host: String,
    /// Local UTC offset in seconds
    pub time_zone_offset: i32,
    /// Increments with every record produced by this process
    pub sample: u64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

pub fn hash_host(host: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Builds [`DeviceRecord`]s for this host.
#[derive(Debug)]
pub struct DeviceRecordProducer {
    hashed_host: String,
    counter: AtomicU64,
}

impl DeviceRecordProducer {
    pub fn new() -> Self {
        Self::for_host(&local_host_name())
    }

    pub fn for_host(host: &str) -> Self {
        Self {
            hashed_host: hash_host(host),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_record(&self) -> DeviceRecord {
        let now = Utc::now();
        DeviceRecord {
            hashed_host: self.hashed_host.clone(),
            time_zone_offset: Local::now().offset().local_minus_utc(),
            sample: self.counter.fetch_add(1, Ordering::Relaxed),
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
        }
    }
}

impl Default for DeviceRecordProducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote sink for device records.
#[async_trait]
pub trait DeviceDataSink: Send + Sync {
    async fn send_device_data(&self, record: &DeviceRecord) -> Result<(), UploadError>;
}

#[async_trait]
impl DeviceDataSink for ApiClient {
    async fn send_device_data(&self, record: &DeviceRecord) -> Result<(), UploadError> {
        ApiClient::send_device_data(self, record)
            .await
            .map_err(UploadError::from)
    }
}

/// Upload a device buffer. Only the first record is sent, so a batch reports
/// the device state at the start of its interval. An empty buffer succeeds
/// without a request.
pub fn upload_first_record(
    sink: Arc<dyn DeviceDataSink>,
    buffer: Buffer<DeviceRecord>,
) -> BoxFuture<'static, Result<(), UploadError>> {
    Box::pin(async move {
        match buffer.records.into_iter().next() {
            Some(record) => sink.send_device_data(&record).await,
            None => Ok(()),
        }
    })
}

/// Wire `uploader` to produce a record on every tick and send each buffer to
/// `sink`, then add a startup record. Returns false if the uploader was
/// already set up.
pub async fn start_device_uploader(
    uploader: &BatchUploader<DeviceRecord>,
    producer: Arc<DeviceRecordProducer>,
    sink: Arc<dyn DeviceDataSink>,
) -> bool {
    let tick_producer = Arc::clone(&producer);
    let started = uploader.setup(
        move || Some(tick_producer.next_record()),
        move |buffer| upload_first_record(Arc::clone(&sink), buffer),
    );

    if started {
        uploader.add_record(producer.next_record()).await;
    }
    started
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<DeviceRecord>>,
    }

    #[async_trait]
    impl DeviceDataSink for RecordingSink {
        async fn send_device_data(&self, record: &DeviceRecord) -> Result<(), UploadError> {
            self.sent.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn buffer(records: Vec<DeviceRecord>) -> Buffer<DeviceRecord> {
        Buffer {
            buffer_id: Uuid::new_v4(),
            archived_at: Utc::now(),
            records,
        }
    }

    #[test]
    fn test_host_hash_is_stable_hex() {
        let hash = hash_host("lab-device-7");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_host("lab-device-7"));
        assert_ne!(hash, hash_host("lab-device-8"));
    }

    #[test]
    fn test_sample_counter_increments() {
        let producer = DeviceRecordProducer::for_host("host");
        let first = producer.next_record();
        let second = producer.next_record();
        assert_eq!(first.sample, 0);
        assert_eq!(second.sample, 1);
        assert_eq!(first.hashed_host, second.hashed_host);
        assert!(second.timestamp >= first.timestamp);
    }

    #[tokio::test]
    async fn test_only_first_record_is_sent() {
        let sink = Arc::new(RecordingSink::default());
        let producer = DeviceRecordProducer::for_host("host");
        let records = vec![producer.next_record(), producer.next_record()];

        upload_first_record(sink.clone(), buffer(records.clone()))
            .await
            .unwrap();

        assert_eq!(*sink.sent.lock().unwrap(), vec![records[0].clone()]);
    }

    #[tokio::test]
    async fn test_empty_buffer_resolves_without_request() {
        let sink = Arc::new(RecordingSink::default());
        upload_first_record(sink.clone(), buffer(vec![])).await.unwrap();
        assert!(sink.sent.lock().unwrap().is_empty());
    }
}
