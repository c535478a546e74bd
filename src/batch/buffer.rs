use crate::storage::StoredBuffer;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An archived batch of typed records handed to the upload request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer<R> {
    /// Archive-assigned id, stable across retries of the same batch
    pub buffer_id: Uuid,

    pub archived_at: DateTime<Utc>,

    /// Records in append order
    pub records: Vec<R>,
}

impl<R: DeserializeOwned> Buffer<R> {
    pub fn from_stored(stored: StoredBuffer) -> Result<Self, serde_json::Error> {
        let records = stored
            .records
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<R>, _>>()?;

        Ok(Self {
            buffer_id: stored.buffer_id,
            archived_at: stored.archived_at,
            records,
        })
    }
}

impl<R> Buffer<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Sample {
        level: f32,
    }

    #[test]
    fn test_from_stored_decodes_records() {
        let stored = StoredBuffer {
            buffer_id: Uuid::new_v4(),
            archived_at: Utc::now(),
            records: vec![json!({ "level": 0.5 }), json!({ "level": 0.25 })],
        };
        let buffer: Buffer<Sample> = Buffer::from_stored(stored.clone()).unwrap();
        assert_eq!(buffer.buffer_id, stored.buffer_id);
        assert_eq!(
            buffer.records,
            vec![Sample { level: 0.5 }, Sample { level: 0.25 }]
        );
    }

    #[test]
    fn test_from_stored_rejects_mismatched_records() {
        let stored = StoredBuffer {
            buffer_id: Uuid::new_v4(),
            archived_at: Utc::now(),
            records: vec![json!("not a sample")],
        };
        assert!(Buffer::<Sample>::from_stored(stored).is_err());
    }
}
