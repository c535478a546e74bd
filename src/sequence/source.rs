use super::category::HealthDataType;
use crate::storage::Anchor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid anchor: expected 8 bytes, got {0}")]
    InvalidAnchor(usize),

    #[error("sample query task failed: {0}")]
    Task(String),
}

impl SourceError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SourceError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

/// Result of an anchored query: the samples found and the anchor to resume
/// from next time.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub anchor: Anchor,
    pub samples: Vec<serde_json::Value>,
}

/// A change feed of raw samples per category.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Return every sample in `[start, end)` newer than `anchor`.
    async fn query(
        &self,
        category: HealthDataType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        anchor: Option<Anchor>,
    ) -> Result<SampleBatch, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SampleDates {
    start_date: DateTime<Utc>,
}

/// Reads samples from `<dir>/<category>.jsonl`, one JSON object per line with
/// at least a `start_date` field. The anchor is the byte offset already
/// consumed.
///
/// Lines must be appended in `start_date` order. Samples dated before the
/// window are consumed and skipped. Reading stops at the first sample dated at
/// or after the window end, which stays unconsumed for a later window. A
/// trailing line without a newline is treated as still being written, and a
/// line that does not decode is logged and consumed.
#[derive(Debug, Clone)]
pub struct JsonlSampleSource {
    dir: PathBuf,
}

impl JsonlSampleSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, category: HealthDataType) -> PathBuf {
        self.dir.join(format!("{}.jsonl", category.key_name()))
    }
}

pub fn offset_anchor(offset: u64) -> Anchor {
    Anchor(offset.to_be_bytes().to_vec())
}

pub fn anchor_offset(anchor: &Anchor) -> Result<u64, SourceError> {
    let bytes: [u8; 8] = anchor
        .0
        .as_slice()
        .try_into()
        .map_err(|_| SourceError::InvalidAnchor(anchor.0.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_window(
    path: &Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    offset: u64,
) -> Result<SampleBatch, SourceError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SampleBatch {
                anchor: offset_anchor(offset),
                samples: Vec::new(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    let mut consumed = offset;
    let mut samples = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            consumed += n as u64;
            continue;
        }

        let decoded = serde_json::from_str::<serde_json::Value>(text).and_then(|sample| {
            serde_json::from_value::<SampleDates>(sample.clone()).map(|dates| (sample, dates))
        });
        let (sample, dates) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    offset = consumed,
                    error = %e,
                    "Discarding undecodable sample line"
                );
                consumed += n as u64;
                continue;
            }
        };

        if dates.start_date >= end {
            break;
        }

        consumed += n as u64;
        if dates.start_date >= start {
            samples.push(sample);
        } else if offset > 0 {
            // A resumed read only meets these when the file is out of order
            // or the previous window was never uploaded.
            warn!(
                path = %path.display(),
                start_date = %dates.start_date,
                window_start = %start,
                "Skipping sample dated before the upload window"
            );
        }
    }

    Ok(SampleBatch {
        anchor: offset_anchor(consumed),
        samples,
    })
}

#[async_trait]
impl SampleSource for JsonlSampleSource {
    async fn query(
        &self,
        category: HealthDataType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        anchor: Option<Anchor>,
    ) -> Result<SampleBatch, SourceError> {
        let offset = match anchor {
            Some(anchor) => anchor_offset(&anchor)?,
            None => 0,
        };
        let path = self.path_for(category);

        tokio::task::spawn_blocking(move || read_window(&path, start, end, offset))
            .await
            .map_err(|e| SourceError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn sample_line(hour: u32, value: u32) -> String {
        format!(
            "{{\"start_date\":\"{}\",\"end_date\":\"{}\",\"value\":{}}}\n",
            at(hour).to_rfc3339(),
            at(hour).to_rfc3339(),
            value
        )
    }

    fn write_samples(dir: &Path, category: HealthDataType, lines: &[String]) {
        let mut file = File::create(dir.join(format!("{}.jsonl", category.key_name()))).unwrap();
        for line in lines {
            file.write_all(line.as_bytes()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonlSampleSource::new(dir.path());
        let batch = source
            .query(HealthDataType::StepCount, at(0), at(5), None)
            .await
            .unwrap();
        assert!(batch.samples.is_empty());
        assert_eq!(anchor_offset(&batch.anchor).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_and_anchor_progression() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![sample_line(1, 10), sample_line(2, 20), sample_line(4, 40)];
        write_samples(dir.path(), HealthDataType::StepCount, &lines);
        let source = JsonlSampleSource::new(dir.path());

        // Hour 1 is before the window: consumed and skipped. Hour 4 is after.
        let first = source
            .query(HealthDataType::StepCount, at(2), at(3), None)
            .await
            .unwrap();
        assert_eq!(first.samples.len(), 1);
        assert_eq!(first.samples[0]["value"], 20);
        let expected = (lines[0].len() + lines[1].len()) as u64;
        assert_eq!(anchor_offset(&first.anchor).unwrap(), expected);

        let second = source
            .query(HealthDataType::StepCount, at(3), at(5), Some(first.anchor))
            .await
            .unwrap();
        assert_eq!(second.samples.len(), 1);
        assert_eq!(second.samples[0]["value"], 40);
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let complete = sample_line(1, 1);
        let partial = "{\"start_date\":\"2024-03-01T01:30".to_string();
        write_samples(dir.path(), HealthDataType::HeartRate, &[complete.clone(), partial]);
        let source = JsonlSampleSource::new(dir.path());

        let batch = source
            .query(HealthDataType::HeartRate, at(0), at(5), None)
            .await
            .unwrap();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(anchor_offset(&batch.anchor).unwrap(), complete.len() as u64);
    }

    #[tokio::test]
    async fn test_malformed_line_is_consumed_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![
            sample_line(1, 10),
            "not json\n".to_string(),
            "{\"value\":3}\n".to_string(),
            sample_line(2, 20),
        ];
        write_samples(dir.path(), HealthDataType::HeartRate, &lines);
        let source = JsonlSampleSource::new(dir.path());

        let batch = source
            .query(HealthDataType::HeartRate, at(0), at(5), None)
            .await
            .unwrap();
        let values: Vec<_> = batch.samples.iter().map(|s| s["value"].clone()).collect();
        assert_eq!(values, vec![serde_json::json!(10), serde_json::json!(20)]);

        let total: usize = lines.iter().map(String::len).sum();
        assert_eq!(anchor_offset(&batch.anchor).unwrap(), total as u64);
    }

    #[tokio::test]
    async fn test_out_of_order_sample_is_consumed_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![sample_line(2, 20), sample_line(4, 40), sample_line(1, 10)];
        write_samples(dir.path(), HealthDataType::StepCount, &lines);
        let source = JsonlSampleSource::new(dir.path());

        let first = source
            .query(HealthDataType::StepCount, at(0), at(3), None)
            .await
            .unwrap();
        assert_eq!(first.samples.len(), 1);

        // The hour 1 line sits after hour 4, so the next window skips it.
        let second = source
            .query(HealthDataType::StepCount, at(3), at(6), Some(first.anchor))
            .await
            .unwrap();
        let values: Vec<_> = second.samples.iter().map(|s| s["value"].clone()).collect();
        assert_eq!(values, vec![serde_json::json!(40)]);
        let total: usize = lines.iter().map(String::len).sum();
        assert_eq!(anchor_offset(&second.anchor).unwrap(), total as u64);
    }

    #[test]
    fn test_invalid_anchor() {
        assert!(matches!(
            anchor_offset(&Anchor(vec![1, 2, 3])),
            Err(SourceError::InvalidAnchor(3))
        ));
    }
}
