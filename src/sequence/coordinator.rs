use super::category::HealthDataType;
use super::sample_uploader::{LogicalUploader, SampleNetwork, SampleUploadError, SampleUploader};
use super::source::SampleSource;
use crate::batch::timers;
use crate::config::types::HealthConfig;
use crate::reachability::Reachability;
use crate::storage::SequenceStorage;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Returns whether a due pass may run now. A denied pass counts as completed.
pub type ClearanceCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceConfig {
    /// Time between the end of one pass and the start of the next
    pub period: Duration,
    /// Reach of the very first upload window
    pub lookback: Duration,
    /// Age after which an interrupted pass is abandoned
    pub pending_expiry: Duration,
    pub chunk_size: Duration,
}

impl From<&HealthConfig> for SequenceConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            period: config.sequence_period,
            lookback: config.lookback,
            pending_expiry: config.pending_expiry,
            chunk_size: config.chunk_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    SequenceScheduled,
    /// Index into the uploader list
    Uploading(usize),
    /// Waiting for connectivity before resuming the interrupted pass
    RetryPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub state: SequenceState,
    pub uploaders: Vec<String>,
    /// Time until the armed sequence timer fires
    pub next_pass_in: Option<Duration>,
}

enum Command {
    Status(oneshot::Sender<CoordinatorStatus>),
}

struct RunCompletion {
    index: usize,
    chunk_start: DateTime<Utc>,
    chunk_end: DateTime<Utc>,
    result: Result<(), SampleUploadError>,
}

/// The window covered by the pass in progress.
#[derive(Debug, Clone, Copy)]
struct PassWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Runs a fixed, ordered list of uploaders one at a time, once per period.
///
/// The key of the last uploader to finish is persisted, so a pass cut short
/// by a restart or by lost connectivity resumes with the next uploader rather
/// than starting over. Each uploader covers the window from the persisted
/// window start to the pass start, in chunks.
pub struct SequenceCoordinator {
    commands: mpsc::Sender<Command>,
    pending: Mutex<Option<(CoordinatorTask, mpsc::Receiver<Command>)>>,
}

impl SequenceCoordinator {
    pub fn new(
        config: SequenceConfig,
        uploaders: Vec<Arc<dyn LogicalUploader>>,
        storage: Arc<dyn SequenceStorage>,
        reachability: Arc<dyn Reachability>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(16);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        info!(uploaders = uploaders.len(), "Sequence coordinator initialized");

        let task = CoordinatorTask {
            config,
            uploaders,
            storage,
            reachability,
            clearance: None,
            state: SequenceState::Idle,
            sequence_deadline: None,
            pass: None,
            completions_tx,
            completions_rx,
        };

        Self {
            commands,
            pending: Mutex::new(Some((task, rx))),
        }
    }

    /// One sample uploader per category, in order. Categories that are not
    /// sample-backed are dropped.
    pub fn for_categories(
        config: SequenceConfig,
        categories: &[HealthDataType],
        source_tag: &str,
        storage: Arc<dyn SequenceStorage>,
        source: Arc<dyn SampleSource>,
        network: Arc<dyn SampleNetwork>,
        reachability: Arc<dyn Reachability>,
    ) -> Self {
        let uploaders = categories
            .iter()
            .filter(|category| category.is_sample_backed())
            .map(|&category| {
                let uploader = SampleUploader::new(
                    category,
                    source_tag,
                    Arc::clone(&storage),
                    Arc::clone(&source),
                )
                .with_network(Arc::clone(&network));
                Arc::new(uploader) as Arc<dyn LogicalUploader>
            })
            .collect();

        Self::new(config, uploaders, storage, reachability)
    }

    /// Gate every due pass on `clearance`. Only effective before
    /// [`start_upload_logic`](Self::start_upload_logic).
    pub fn set_clearance(&self, clearance: ClearanceCheck) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some((task, _)) = pending.as_mut() {
                task.clearance = Some(clearance);
            }
        }
    }

    /// Schedule the first pass and start reacting to reachability. Does
    /// nothing without uploaders or when already started; returns whether
    /// the coordinator was started by this call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_upload_logic(&self) -> bool {
        let pending = match self.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };

        let Some((task, commands)) = pending else {
            debug!("Upload logic already started");
            return false;
        };

        if task.uploaders.is_empty() {
            info!("Upload logic not started, no categories to process");
            return false;
        }

        info!("Upload logic started");
        tokio::spawn(task.run(commands));
        true
    }

    pub fn is_started(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.is_none())
            .unwrap_or(true)
    }

    /// Current state, or `None` when the coordinator is not running.
    pub async fn status(&self) -> Option<CoordinatorStatus> {
        if !self.is_started() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Status(tx)).await.ok()?;
        rx.await.ok()
    }
}

struct CoordinatorTask {
    config: SequenceConfig,
    uploaders: Vec<Arc<dyn LogicalUploader>>,
    storage: Arc<dyn SequenceStorage>,
    reachability: Arc<dyn Reachability>,
    clearance: Option<ClearanceCheck>,
    state: SequenceState,
    sequence_deadline: Option<Instant>,
    pass: Option<PassWindow>,
    completions_tx: mpsc::UnboundedSender<RunCompletion>,
    completions_rx: mpsc::UnboundedReceiver<RunCompletion>,
}

impl CoordinatorTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut reachability = self.reachability.subscribe();
        let mut was_reachable = *reachability.borrow_and_update();
        let mut reachability_open = true;

        self.ensure_window_start().await;
        self.schedule_upload_sequence().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    None => break,
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_run_completion(completion).await;
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
                _ = timers::sleep_until(self.sequence_deadline) => {
                    self.sequence_deadline = None;
                    self.start_upload_sequence().await;
                }
            }
        }

        info!("Sequence coordinator stopped");
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            state: self.state,
            uploaders: self
                .uploaders
                .iter()
                .map(|uploader| uploader.key().to_string())
                .collect(),
            next_pass_in: self
                .sequence_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now())),
        }
    }

    async fn handle_reachable(&mut self) {
        match self.state {
            SequenceState::RetryPending => {
                info!("Connection re-established, resuming upload sequence");
                self.start_upload_sequence().await;
            }
            SequenceState::SequenceScheduled => {
                info!("Connection re-established, starting upload sequence now");
                self.sequence_deadline = None;
                self.start_upload_sequence().await;
            }
            SequenceState::Idle | SequenceState::Uploading(_) => {}
        }
    }

    async fn ensure_window_start(&self) {
        match self.storage.upload_window_start().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let lookback =
                    chrono::Duration::from_std(self.config.lookback).unwrap_or(chrono::Duration::zero());
                let start = Utc::now() - lookback;
                if let Err(e) = self.storage.set_upload_window_start(start).await {
                    error!(error = %e, "Failed to initialize upload window start");
                }
            }
            Err(e) => error!(error = %e, "Failed to read upload window start"),
        }
    }

    async fn schedule_upload_sequence(&mut self) {
        let now = Utc::now();
        let delay = match self.storage.last_pass_completion().await {
            Ok(Some(completion)) => {
                let period = chrono::Duration::from_std(self.config.period)
                    .unwrap_or(chrono::Duration::zero());
                (completion + period - now).to_std().unwrap_or(Duration::ZERO)
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                error!(error = %e, "Failed to read last pass completion");
                Duration::ZERO
            }
        };

        debug!(delay_ms = delay.as_millis() as u64, "Upload sequence scheduled");
        self.sequence_deadline = Some(Instant::now() + delay);
        self.state = SequenceState::SequenceScheduled;
    }

    /// End of the pass that was interrupted before completing, if it is
    /// still recent enough to resume. Every uploader in a pass shares one
    /// window end, so consecutive windows stay contiguous per uploader.
    async fn interrupted_pass_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let started = match self.storage.last_pass_start().await {
            Ok(started) => started?,
            Err(e) => {
                error!(error = %e, "Failed to read last pass start");
                return None;
            }
        };

        let expiry =
            chrono::Duration::from_std(self.config.pending_expiry).unwrap_or(chrono::Duration::zero());
        if started + expiry < now {
            debug!("Interrupted pass expired, restarting from the first uploader");
            if let Err(e) = self.storage.set_last_completed_uploader(None).await {
                error!(error = %e, "Failed to clear last completed uploader");
            }
            return None;
        }

        match self.storage.last_pass_completion().await {
            Ok(Some(completion)) if completion >= started => None,
            Ok(_) => Some(started),
            Err(e) => {
                error!(error = %e, "Failed to read last pass completion");
                None
            }
        }
    }

    async fn start_upload_sequence(&mut self) {
        if let Some(clearance) = &self.clearance {
            if !clearance() {
                info!("Upload sequence has no clearance, skipping this pass");
                if let Err(e) = self.storage.set_last_pass_completion(Utc::now()).await {
                    error!(error = %e, "Failed to save pass completion");
                }
                if let Err(e) = self.storage.set_last_completed_uploader(None).await {
                    error!(error = %e, "Failed to clear last completed uploader");
                }
                self.state = SequenceState::Idle;
                self.schedule_upload_sequence().await;
                return;
            }
        }

        let now = Utc::now();
        let window_end = match self.interrupted_pass_end(now).await {
            Some(end) => end,
            None => {
                if let Err(e) = self.storage.set_last_pass_start(now).await {
                    error!(error = %e, "Failed to save pass start");
                }
                now
            }
        };

        let window_start = match self.storage.upload_window_start().await {
            Ok(Some(start)) => start,
            Ok(None) => now,
            Err(e) => {
                error!(error = %e, "Failed to read upload window start");
                now
            }
        };
        let window = PassWindow {
            start: window_start.min(window_end),
            end: window_end,
        };
        self.pass = Some(window);

        let cursor = match self.storage.last_completed_uploader().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(error = %e, "Failed to read last completed uploader");
                None
            }
        };

        let index = match cursor {
            Some(key) => match self.uploaders.iter().position(|u| u.key() == key) {
                Some(position) => {
                    info!(last_completed = %key, "Resuming upload sequence");
                    position + 1
                }
                None => {
                    warn!(last_completed = %key, "Unknown resume cursor, starting from first uploader");
                    0
                }
            },
            None => {
                info!(
                    window_start = %window.start,
                    window_end = %window.end,
                    "Upload sequence started"
                );
                0
            }
        };

        if index >= self.uploaders.len() {
            warn!("No uploader left after the resume cursor, completing pass");
            self.complete_pass().await;
            return;
        }

        self.start_upload(index, window.start).await;
    }

    async fn start_upload(&mut self, index: usize, chunk_start: DateTime<Utc>) {
        if !self.reachability.is_currently_reachable() {
            info!("Upload sequence stopped, backend unreachable");
            self.sequence_deadline = None;
            self.state = SequenceState::RetryPending;
            return;
        }

        let Some(window) = self.pass else {
            error!("Upload started without a pass window");
            self.state = SequenceState::Idle;
            return;
        };

        let chunk = chrono::Duration::from_std(self.config.chunk_size)
            .unwrap_or(chrono::Duration::hours(1));
        let chunk_end = chunk_start
            .checked_add_signed(chunk)
            .map_or(window.end, |end| end.min(window.end));

        let uploader = Arc::clone(&self.uploaders[index]);
        debug!(
            uploader = %uploader.key(),
            chunk_start = %chunk_start,
            chunk_end = %chunk_end,
            "Running uploader"
        );

        self.state = SequenceState::Uploading(index);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = uploader.run(chunk_start, chunk_end).await;
            let _ = completions.send(RunCompletion {
                index,
                chunk_start,
                chunk_end,
                result,
            });
        });
    }

    async fn handle_run_completion(&mut self, completion: RunCompletion) {
        let key = self.uploaders[completion.index].key().to_string();

        match completion.result {
            Ok(()) => {
                let more_chunks = self
                    .pass
                    .is_some_and(|window| completion.chunk_end < window.end);
                if more_chunks {
                    self.start_upload(completion.index, completion.chunk_end).await;
                } else {
                    debug!(uploader = %key, "Uploader completed");
                    self.uploader_finished(completion.index).await;
                }
            }
            Err(e) if e.is_connectivity() => {
                info!(uploader = %key, error = %e, "Connectivity error, retrying current chunk");
                self.start_upload(completion.index, completion.chunk_start)
                    .await;
            }
            Err(e) => {
                warn!(uploader = %key, error = %e, "Uploader failed, skipping to next");
                self.uploader_finished(completion.index).await;
            }
        }
    }

    async fn uploader_finished(&mut self, index: usize) {
        let key = self.uploaders[index].key().to_string();
        if let Err(e) = self.storage.set_last_completed_uploader(Some(&key)).await {
            error!(uploader = %key, error = %e, "Failed to save last completed uploader");
        }

        let next = index + 1;
        match (self.uploaders.get(next), self.pass) {
            (Some(_), Some(window)) => self.start_upload(next, window.start).await,
            _ => self.complete_pass().await,
        }
    }

    async fn complete_pass(&mut self) {
        let now = Utc::now();
        info!("Upload sequence completed");

        if let Err(e) = self.storage.set_last_pass_completion(now).await {
            error!(error = %e, "Failed to save pass completion");
        }
        if let Err(e) = self.storage.set_last_completed_uploader(None).await {
            error!(error = %e, "Failed to clear last completed uploader");
        }
        if let Some(window) = self.pass.take() {
            if let Err(e) = self.storage.set_upload_window_start(window.end).await {
                error!(error = %e, "Failed to advance upload window");
            }
        }

        self.state = SequenceState::Idle;
        self.schedule_upload_sequence().await;
    }
}
