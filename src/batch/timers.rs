use crate::storage::DateType;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

// Roughly thirty years; used when a due-date does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// In-memory deadlines for the three one-shot timers of a batch uploader.
///
/// Clearing a deadline is how a timer is invalidated; the persisted due-date
/// is handled by the owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timers {
    record: Option<Instant>,
    upload: Option<Instant>,
    retry: Option<Instant>,
}

impl Timers {
    fn slot(&mut self, date_type: DateType) -> &mut Option<Instant> {
        match date_type {
            DateType::NextBufferRecord => &mut self.record,
            DateType::NextBufferUpload => &mut self.upload,
            DateType::NextBufferUploadRetry => &mut self.retry,
        }
    }

    pub fn is_armed(&self, date_type: DateType) -> bool {
        match date_type {
            DateType::NextBufferRecord => self.record.is_some(),
            DateType::NextBufferUpload => self.upload.is_some(),
            DateType::NextBufferUploadRetry => self.retry.is_some(),
        }
    }

    /// Arm `date_type` so it fires at the wall-clock time `due`. A due time in
    /// the past fires on the next poll.
    pub fn arm_at(&mut self, date_type: DateType, due: DateTime<Utc>) {
        let delay = (due - Utc::now()).to_std().unwrap_or_default();
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        *self.slot(date_type) = Some(deadline);
    }

    pub fn clear(&mut self, date_type: DateType) {
        *self.slot(date_type) = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.record, self.upload, self.retry]
            .into_iter()
            .flatten()
            .min()
    }

    /// Disarm and return every timer whose deadline has passed, in
    /// record, upload, retry order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<DateType> {
        let mut expired = Vec::new();
        for date_type in DateType::ALL {
            let slot = self.slot(date_type);
            if matches!(slot, Some(deadline) if *deadline <= now) {
                *slot = None;
                expired.push(date_type);
            }
        }
        expired
    }
}

/// Sleep until `deadline`, or forever when nothing is armed.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_only_returns_due_timers() {
        let mut timers = Timers::default();
        timers.arm_at(DateType::NextBufferRecord, Utc::now() - ChronoDuration::seconds(5));
        timers.arm_at(DateType::NextBufferUpload, Utc::now() + ChronoDuration::hours(1));

        let expired = timers.take_expired(Instant::now());
        assert_eq!(expired, vec![DateType::NextBufferRecord]);
        assert!(!timers.is_armed(DateType::NextBufferRecord));
        assert!(timers.is_armed(DateType::NextBufferUpload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_is_earliest() {
        let mut timers = Timers::default();
        assert!(timers.next_deadline().is_none());

        timers.arm_at(DateType::NextBufferUpload, Utc::now() + ChronoDuration::minutes(10));
        timers.arm_at(DateType::NextBufferUploadRetry, Utc::now() + ChronoDuration::minutes(1));
        let retry_deadline = timers.next_deadline().unwrap();

        timers.clear(DateType::NextBufferUploadRetry);
        assert!(timers.next_deadline().unwrap() > retry_deadline);
    }
}
