use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    pub device: BatchUploaderConfig,
    /// Omit to disable health sample uploads entirely
    #[serde(default)]
    pub health: Option<HealthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Tag attached to every health upload to identify the producing device
    #[serde(default = "default_source_tag")]
    pub source: String,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_source_tag() -> String {
    "batchup".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    /// URL checked with a HEAD request. Empty means always reachable.
    #[serde(default)]
    pub check_url: String,
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            check_url: String::new(),
            check_interval: default_check_interval(),
            timeout: default_check_timeout(),
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Settings for one batch uploader. The identifier partitions every piece of
/// persisted state, so two uploaders must never share one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUploaderConfig {
    pub identifier: String,

    /// Used until a record interval has been persisted. Zero disables the uploader.
    #[serde(with = "humantime_serde")]
    pub default_record_interval: Duration,

    /// Batching interval. Absent means every record is uploaded as soon as it
    /// is added.
    #[serde(default, with = "humantime_serde")]
    pub upload_interval: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub upload_retry_interval: Duration,

    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,

    #[serde(default)]
    pub enable_debug_log: bool,
}

fn default_buffer_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between the end of one full pass and the start of the next
    #[serde(default = "default_sequence_period", with = "humantime_serde")]
    pub sequence_period: Duration,

    /// How far back the very first pass reaches
    #[serde(default = "default_lookback", with = "humantime_serde")]
    pub lookback: Duration,

    /// An interrupted pass older than this is abandoned and the next pass
    /// starts again from the first category
    #[serde(default = "default_pending_expiry", with = "humantime_serde")]
    pub pending_expiry: Duration,

    /// Size of each window slice uploaded in one run
    #[serde(default = "default_chunk_size", with = "humantime_serde")]
    pub chunk_size: Duration,

    /// Directory holding one `<category>.jsonl` file per category
    pub data_dir: PathBuf,

    /// Upload order. Characteristic categories are ignored.
    pub categories: Vec<String>,
}

fn default_sequence_period() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_lookback() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_pending_expiry() -> Duration {
    Duration::from_secs(2 * 24 * 3600)
}

fn default_chunk_size() -> Duration {
    Duration::from_secs(3600)
}
