use crate::batch::BatchUploader;
use crate::config::parse::{load_config, ConfigError};
use crate::device::{start_device_uploader, DeviceRecord, DeviceRecordProducer};
use crate::network::{ApiClient, ApiError};
use crate::reachability::{ReachabilityMonitor, ReachabilityPoller};
use crate::sequence::{
    HealthDataType, JsonlSampleSource, SequenceConfig, SequenceCoordinator, UnknownCategory,
};
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::traits::StorageError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("backend client error: {0}")]
    Api(#[from] ApiError),

    #[error("reachability poller error: {0}")]
    Poller(#[source] reqwest::Error),

    #[error("{0}")]
    Category(#[from] UnknownCategory),

    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/batchup/config.yml");
            eprintln!("  /etc/batchup/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'batchup config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_uploaders(&config_path).await.map_err(|e| e.into())
}

async fn run_uploaders(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;

    let shutdown = CancellationToken::new();
    let monitor = Arc::new(ReachabilityMonitor::new(true));
    if config.reachability.check_url.is_empty() {
        info!("No check URL configured, backend assumed reachable");
    } else {
        let poller = ReachabilityPoller::new(&config.reachability).map_err(RunError::Poller)?;
        info!(url = %config.reachability.check_url, "Starting reachability poller");
        tokio::spawn(poller.run(monitor.clone(), shutdown.clone()));
    }

    let client = Arc::new(ApiClient::new(&config.backend)?);

    info!(uploader = %config.device.identifier, "Starting device uploader");
    let device_uploader: BatchUploader<DeviceRecord> =
        BatchUploader::new(config.device.clone(), storage.clone(), monitor.clone());
    start_device_uploader(
        &device_uploader,
        Arc::new(DeviceRecordProducer::new()),
        client.clone(),
    )
    .await;

    let coordinator = match &config.health {
        Some(health) => {
            let categories = health
                .categories
                .iter()
                .map(|category| category.parse::<HealthDataType>())
                .collect::<Result<Vec<_>, _>>()?;

            let coordinator = SequenceCoordinator::for_categories(
                SequenceConfig::from(health),
                &categories,
                &config.backend.source,
                storage.clone(),
                Arc::new(JsonlSampleSource::new(&health.data_dir)),
                client.clone(),
                monitor.clone(),
            );
            coordinator.start_upload_logic();
            Some(coordinator)
        }
        None => {
            info!("No health section configured, sample uploads disabled");
            None
        }
    };

    info!("Uploaders started, press Ctrl+C to shutdown");
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    drop(coordinator);
    drop(device_uploader);

    if let Err(e) = storage.checkpoint().await {
        warn!(error = %e, "Failed to checkpoint storage on shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}
