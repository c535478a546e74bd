use super::buffer::Buffer;
use super::timers::{self, Timers};
use crate::config::types::BatchUploaderConfig;
use crate::network::UploadError;
use crate::reachability::Reachability;
use crate::storage::{BatchStorage, DateType};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Called on every record tick; `None` skips the tick.
pub type RecordProducer<R> = Box<dyn FnMut() -> Option<R> + Send + Sync>;

/// Builds the operation that uploads one archived buffer.
pub type UploadRequest<R> =
    Arc<dyn Fn(Buffer<R>) -> BoxFuture<'static, Result<(), UploadError>> + Send + Sync>;

const COMMAND_CHANNEL_SIZE: usize = 256;

macro_rules! step {
    ($task:expr, $($arg:tt)+) => {
        if $task.config.enable_debug_log {
            tracing::debug!(uploader = %$task.config.identifier, $($arg)+);
        }
    };
}

/// Snapshot of an uploader's in-memory scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploaderStatus {
    pub running: bool,
    pub record_interval: Duration,
    pub record_timer_armed: bool,
    pub upload_timer_armed: bool,
    pub retry_timer_armed: bool,
    pub upload_in_flight: bool,
    pub current_records: usize,
    pub archived_buffers: usize,
}

enum Command<R> {
    AddRecord(R, oneshot::Sender<()>),
    SetRecordInterval(Duration, oneshot::Sender<()>),
    Status(oneshot::Sender<UploaderStatus>),
}

struct UploadCompletion {
    buffer_id: Uuid,
    result: Result<(), UploadError>,
}

/// Captures records on a fixed cadence, archives them into buffers and
/// uploads archived buffers oldest-first, retrying on failure.
///
/// Scheduling survives restarts: every armed timer has its due-date persisted
/// in [`BatchStorage`], and [`BatchUploader::setup`] restores the timers from
/// those dates before anything else happens.
///
/// All state lives in a single task spawned by `setup`. Calls made before
/// `setup` are queued and applied once the task starts.
pub struct BatchUploader<R> {
    config: Arc<BatchUploaderConfig>,
    storage: Arc<dyn BatchStorage>,
    reachability: Arc<dyn Reachability>,
    commands: mpsc::Sender<Command<R>>,
    pending_commands: Mutex<Option<mpsc::Receiver<Command<R>>>>,
}

impl<R> BatchUploader<R>
where
    R: Serialize + DeserializeOwned + Debug + Send + 'static,
{
    pub fn new(
        config: BatchUploaderConfig,
        storage: Arc<dyn BatchStorage>,
        reachability: Arc<dyn Reachability>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        Self {
            config: Arc::new(config),
            storage,
            reachability,
            commands,
            pending_commands: Mutex::new(Some(rx)),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn setup_completed(&self) -> bool {
        self.pending_commands
            .lock()
            .map(|pending| pending.is_none())
            .unwrap_or(true)
    }

    /// Wire the record producer and upload request, restore persisted timers
    /// and start the uploader task. Only the first call has any effect;
    /// returns whether this call performed the setup.
    ///
    /// Must be called from within a tokio runtime.
    pub fn setup<P, U>(&self, get_record: P, upload_request: U) -> bool
    where
        P: FnMut() -> Option<R> + Send + Sync + 'static,
        U: Fn(Buffer<R>) -> BoxFuture<'static, Result<(), UploadError>> + Send + Sync + 'static,
    {
        let receiver = match self.pending_commands.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };

        let Some(commands) = receiver else {
            tracing::debug!(uploader = %self.config.identifier, "Setup already completed");
            return false;
        };

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let task = UploaderTask {
            config: Arc::clone(&self.config),
            storage: Arc::clone(&self.storage),
            reachability: Arc::clone(&self.reachability),
            get_record: Box::new(get_record),
            upload_request: Arc::new(upload_request),
            timers: Timers::default(),
            upload_in_flight: None,
            completions_tx,
        };

        info!(uploader = %self.config.identifier, "Starting batch uploader");
        tokio::spawn(task.run(commands, completions_rx));
        true
    }

    /// Append a record to the current buffer. Ignored while the uploader is
    /// disabled (record interval of zero). Without an upload interval the
    /// buffer is archived and uploaded right away.
    pub async fn add_record(&self, record: R) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::AddRecord(record, done_tx), done_rx).await;
    }

    /// Persist a new record interval. A positive interval reschedules the
    /// record timer (and starts the upload timer if none is armed); zero
    /// disables the uploader, tearing down every timer and discarding all
    /// buffered records.
    pub async fn set_record_interval(&self, interval: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::SetRecordInterval(interval, done_tx), done_rx)
            .await;
    }

    /// Current scheduling state, or `None` before `setup`.
    pub async fn status(&self) -> Option<UploaderStatus> {
        if !self.setup_completed() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Queue a command. Once the task is running, also wait until it has been
    /// applied.
    async fn send<T>(&self, command: Command<R>, done: oneshot::Receiver<T>) {
        let running = self.setup_completed();
        if self.commands.send(command).await.is_err() {
            warn!(uploader = %self.config.identifier, "Uploader task has stopped");
            return;
        }
        if running {
            let _ = done.await;
        }
    }
}

struct UploaderTask<R> {
    config: Arc<BatchUploaderConfig>,
    storage: Arc<dyn BatchStorage>,
    reachability: Arc<dyn Reachability>,
    get_record: RecordProducer<R>,
    upload_request: UploadRequest<R>,
    timers: Timers,
    upload_in_flight: Option<Uuid>,
    completions_tx: mpsc::UnboundedSender<UploadCompletion>,
}

impl<R> UploaderTask<R>
where
    R: Serialize + DeserializeOwned + Debug + Send + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command<R>>,
        mut completions: mpsc::UnboundedReceiver<UploadCompletion>,
    ) {
        let mut reachability = self.reachability.subscribe();
        let mut was_reachable = *reachability.borrow_and_update();
        let mut reachability_open = true;

        self.restore_record_timer().await;
        self.restore_upload_timer().await;
        self.restore_retry_timer().await;

        loop {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(completion) = completions.recv() => {
                    self.handle_upload_completion(completion).await;
                }
                changed = reachability.changed(), if reachability_open => match changed {
                    Ok(()) => {
                        let reachable = *reachability.borrow_and_update();
                        if reachable && !was_reachable {
                            self.handle_reachable().await;
                        }
                        was_reachable = reachable;
                    }
                    Err(_) => reachability_open = false,
                },
                _ = timers::sleep_until(deadline) => {
                    for date_type in self.timers.take_expired(Instant::now()) {
                        self.handle_timer(date_type).await;
                    }
                }
            }
        }

        info!(uploader = %self.config.identifier, "Batch uploader stopped");
    }

    async fn handle_command(&mut self, command: Command<R>) {
        match command {
            Command::AddRecord(record, done) => {
                self.add_record(record).await;
                let _ = done.send(());
            }
            Command::SetRecordInterval(interval, done) => {
                self.set_record_interval(interval).await;
                let _ = done.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status().await);
            }
        }
    }

    async fn handle_timer(&mut self, date_type: DateType) {
        match date_type {
            DateType::NextBufferRecord => {
                step!(self, "Record timer tick, adding record and rescheduling");
                self.add_record_from_producer().await;
                if self.is_running().await {
                    let interval = self.record_interval().await;
                    self.schedule(DateType::NextBufferRecord, interval).await;
                }
            }
            DateType::NextBufferUpload => {
                step!(self, "Upload timer tick, archiving and uploading");
                self.archive_and_upload().await;
                if let Some(upload_interval) = self.config.upload_interval {
                    self.schedule(DateType::NextBufferUpload, upload_interval)
                        .await;
                }
            }
            DateType::NextBufferUploadRetry => {
                if self.reachability.is_currently_reachable() {
                    step!(self, "Retry timer tick with connection, uploading buffers");
                    self.upload_buffers().await;
                } else {
                    step!(self, "Retry timer tick without connection, waiting");
                }
            }
        }
    }

    async fn handle_reachable(&mut self) {
        if self
            .persisted_date(DateType::NextBufferUploadRetry)
            .await
            .is_some()
        {
            step!(self, "Connection re-established while retry pending, uploading buffers");
            self.upload_buffers().await;
        }
    }

    // ===== Startup recovery =====

    async fn restore_record_timer(&mut self) {
        if !self.is_running().await {
            step!(self, "Not running, resetting record timer");
            self.reset(DateType::NextBufferRecord).await;
            return;
        }

        let interval = self.record_interval().await;
        match self.persisted_date(DateType::NextBufferRecord).await {
            Some(due) if due <= Utc::now() => {
                step!(self, "Record timer expired while stopped, adding record");
                self.add_record_from_producer().await;
                self.schedule(DateType::NextBufferRecord, interval).await;
            }
            Some(due) => {
                step!(self, due = %due, "Restoring record timer");
                self.arm(DateType::NextBufferRecord, due).await;
            }
            None => {
                step!(self, "No record timer found, scheduling");
                self.schedule(DateType::NextBufferRecord, interval).await;
            }
        }
    }

    async fn restore_upload_timer(&mut self) {
        if !self.is_running().await {
            step!(self, "Not running, resetting upload timer");
            self.reset(DateType::NextBufferUpload).await;
            return;
        }

        let Some(upload_interval) = self.config.upload_interval else {
            step!(self, "No upload interval, records are uploaded as they arrive");
            return;
        };

        match self.persisted_date(DateType::NextBufferUpload).await {
            Some(due) if due <= Utc::now() => {
                step!(self, "Upload timer expired while stopped, archiving and uploading");
                self.archive_and_upload().await;
                self.schedule(DateType::NextBufferUpload, upload_interval)
                    .await;
            }
            Some(due) => {
                step!(self, due = %due, "Restoring upload timer");
                self.arm(DateType::NextBufferUpload, due).await;
            }
            None => {
                step!(self, "No upload timer found, scheduling");
                self.schedule(DateType::NextBufferUpload, upload_interval)
                    .await;
            }
        }
    }

    async fn restore_retry_timer(&mut self) {
        if !self.is_running().await {
            step!(self, "Not running, resetting retry timer");
            self.reset(DateType::NextBufferUploadRetry).await;
            return;
        }

        match self.persisted_date(DateType::NextBufferUploadRetry).await {
            Some(due) if due <= Utc::now() => {
                step!(self, "Retry timer expired while stopped, uploading buffers");
                self.upload_buffers().await;
            }
            Some(due) => {
                step!(self, due = %due, "Restoring retry timer");
                self.arm(DateType::NextBufferUploadRetry, due).await;
            }
            None => {}
        }
    }

    // ===== Operations =====

    async fn set_record_interval(&mut self, interval: Duration) {
        let persisted = match self.storage.get_record_interval(&self.config.identifier).await {
            Ok(persisted) => persisted,
            Err(e) => {
                error!(uploader = %self.config.identifier, error = %e, "Failed to read record interval");
                None
            }
        };

        if persisted == Some(interval) {
            step!(self, interval_ms = interval.as_millis() as u64, "Record interval unchanged");
            return;
        }

        if let Err(e) = self
            .storage
            .save_record_interval(&self.config.identifier, interval)
            .await
        {
            error!(uploader = %self.config.identifier, error = %e, "Failed to save record interval");
            return;
        }

        info!(
            uploader = %self.config.identifier,
            interval_ms = interval.as_millis() as u64,
            "Record interval changed"
        );

        if self.is_running().await {
            self.schedule(DateType::NextBufferRecord, interval).await;
            if let Some(upload_interval) = self.config.upload_interval {
                if !self.timers.is_armed(DateType::NextBufferUpload) {
                    self.schedule(DateType::NextBufferUpload, upload_interval)
                        .await;
                }
            }
        } else {
            step!(self, "Uploader disabled, resetting timers and buffers");
            for date_type in DateType::ALL {
                self.reset(date_type).await;
            }
            if let Err(e) = self.storage.reset_all_buffers(&self.config.identifier).await {
                error!(uploader = %self.config.identifier, error = %e, "Failed to reset buffers");
            }
        }
    }

    async fn add_record_from_producer(&mut self) {
        if let Some(record) = (self.get_record)() {
            self.add_record(record).await;
        }
    }

    async fn add_record(&mut self, record: R) {
        if !self.is_running().await {
            step!(self, "Record ignored, uploader is not running");
            return;
        }

        step!(self, record = ?record, "Appending record to current buffer");
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                error!(uploader = %self.config.identifier, error = %e, "Failed to serialize record");
                return;
            }
        };

        if let Err(e) = self
            .storage
            .append_record(&self.config.identifier, value)
            .await
        {
            error!(uploader = %self.config.identifier, error = %e, "Failed to append record");
            return;
        }

        if self.config.upload_interval.is_none() {
            self.archive_and_upload().await;
        }
    }

    async fn archive_and_upload(&mut self) {
        match self
            .storage
            .archive_current_buffer(&self.config.identifier, self.config.buffer_limit)
            .await
        {
            Ok(outcome) => {
                if outcome.dropped > 0 {
                    warn!(
                        uploader = %self.config.identifier,
                        dropped = outcome.dropped,
                        buffer_limit = self.config.buffer_limit,
                        "Buffer limit exceeded, dropped oldest archived buffers"
                    );
                }
                if let Some(buffer_id) = outcome.archived {
                    step!(self, buffer_id = %buffer_id, "Archived current buffer");
                }
            }
            Err(e) => {
                error!(uploader = %self.config.identifier, error = %e, "Failed to archive buffer");
            }
        }

        self.upload_buffers().await;
    }

    /// Start uploading the oldest archived buffer. The completion handler
    /// continues with the next one, so the archive drains oldest-first with
    /// a single upload outstanding.
    async fn upload_buffers(&mut self) {
        self.reset(DateType::NextBufferUploadRetry).await;

        if !self.is_running().await {
            step!(self, "Upload skipped, uploader is not running");
            return;
        }

        if let Some(buffer_id) = self.upload_in_flight {
            step!(self, buffer_id = %buffer_id, "Upload already in flight");
            return;
        }

        let buffer = loop {
            let stored = match self
                .storage
                .oldest_archived_buffer(&self.config.identifier)
                .await
            {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    step!(self, "No archived buffers to upload");
                    return;
                }
                Err(e) => {
                    error!(uploader = %self.config.identifier, error = %e, "Failed to read archived buffer");
                    return;
                }
            };

            let buffer_id = stored.buffer_id;
            match Buffer::<R>::from_stored(stored) {
                Ok(buffer) => break buffer,
                Err(e) => {
                    // Undecodable buffers can never be uploaded.
                    error!(
                        uploader = %self.config.identifier,
                        buffer_id = %buffer_id,
                        error = %e,
                        "Discarding undecodable archived buffer"
                    );
                    if let Err(e) = self
                        .storage
                        .remove_oldest_archived_buffer(&self.config.identifier, buffer_id)
                        .await
                    {
                        error!(uploader = %self.config.identifier, error = %e, "Failed to remove buffer");
                        return;
                    }
                }
            }
        };

        let buffer_id = buffer.buffer_id;
        step!(self, buffer_id = %buffer_id, records = buffer.len(), "Uploading oldest buffer");

        let operation = (self.upload_request)(buffer);
        let completions = self.completions_tx.clone();
        self.upload_in_flight = Some(buffer_id);
        tokio::spawn(async move {
            let result = operation.await;
            let _ = completions.send(UploadCompletion { buffer_id, result });
        });
    }

    async fn handle_upload_completion(&mut self, completion: UploadCompletion) {
        if self.upload_in_flight == Some(completion.buffer_id) {
            self.upload_in_flight = None;
        }

        match completion.result {
            Ok(()) => {
                step!(self, buffer_id = %completion.buffer_id, "Buffer uploaded");
                match self
                    .storage
                    .remove_oldest_archived_buffer(&self.config.identifier, completion.buffer_id)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        step!(self, buffer_id = %completion.buffer_id, "Uploaded buffer no longer at archive head");
                    }
                    Err(e) => {
                        error!(uploader = %self.config.identifier, error = %e, "Failed to remove uploaded buffer");
                        return;
                    }
                }
                self.upload_buffers().await;
            }
            Err(e) => {
                warn!(
                    uploader = %self.config.identifier,
                    buffer_id = %completion.buffer_id,
                    error = %e,
                    "Buffer upload failed"
                );
                if !self.is_running().await {
                    step!(self, "Uploader stopped while uploading, no retry");
                    return;
                }
                let retry_interval = self.config.upload_retry_interval;
                self.schedule(DateType::NextBufferUploadRetry, retry_interval)
                    .await;
            }
        }
    }

    async fn status(&self) -> UploaderStatus {
        let identifier = &self.config.identifier;
        UploaderStatus {
            running: self.is_running().await,
            record_interval: self.record_interval().await,
            record_timer_armed: self.timers.is_armed(DateType::NextBufferRecord),
            upload_timer_armed: self.timers.is_armed(DateType::NextBufferUpload),
            retry_timer_armed: self.timers.is_armed(DateType::NextBufferUploadRetry),
            upload_in_flight: self.upload_in_flight.is_some(),
            current_records: self.storage.current_buffer_len(identifier).await.unwrap_or(0),
            archived_buffers: self
                .storage
                .archived_buffer_count(identifier)
                .await
                .unwrap_or(0),
        }
    }

    // ===== Timer and storage helpers =====

    async fn record_interval(&self) -> Duration {
        match self.storage.get_record_interval(&self.config.identifier).await {
            Ok(Some(interval)) => interval,
            Ok(None) => self.config.default_record_interval,
            Err(e) => {
                error!(uploader = %self.config.identifier, error = %e, "Failed to read record interval");
                self.config.default_record_interval
            }
        }
    }

    async fn is_running(&self) -> bool {
        !self.record_interval().await.is_zero()
    }

    async fn persisted_date(&self, date_type: DateType) -> Option<DateTime<Utc>> {
        match self.storage.get_date(&self.config.identifier, date_type).await {
            Ok(date) => date,
            Err(e) => {
                error!(uploader = %self.config.identifier, date_type = %date_type, error = %e, "Failed to read due-date");
                None
            }
        }
    }

    /// Arm `date_type` for a full `delay` from now, replacing any armed timer.
    async fn schedule(&mut self, date_type: DateType, delay: Duration) {
        let now = Utc::now();
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.arm(date_type, due).await;
    }

    async fn arm(&mut self, date_type: DateType, due: DateTime<Utc>) {
        self.timers.clear(date_type);
        if let Err(e) = self
            .storage
            .save_date(&self.config.identifier, date_type, due)
            .await
        {
            error!(uploader = %self.config.identifier, date_type = %date_type, error = %e, "Failed to save due-date");
        }
        self.timers.arm_at(date_type, due);
        step!(self, date_type = %date_type, due = %due, "Timer armed");
    }

    async fn reset(&mut self, date_type: DateType) {
        self.timers.clear(date_type);
        if let Err(e) = self
            .storage
            .reset_date(&self.config.identifier, date_type)
            .await
        {
            error!(uploader = %self.config.identifier, date_type = %date_type, error = %e, "Failed to reset due-date");
        }
    }
}
