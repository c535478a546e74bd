use crate::config::parse::load_config;
use crate::config::Config;
use crate::storage::traits::{BatchStorage, DateType, SequenceStorage, StorageError};
use crate::storage::DuckDbStorage;
use chrono::{DateTime, Utc};
use humantime_serde::re::humantime::format_duration;
use std::fmt::Write;
use std::path::PathBuf;

pub async fn status(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;
    let config = load_config(&path)?;

    let storage = DuckDbStorage::new(&config.storage.path)?;
    storage.init_schema().await?;

    print!("{}", render_status(&config, &storage).await?);
    Ok(())
}

fn format_date(date: Option<DateTime<Utc>>) -> String {
    date.map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

/// Human-readable dump of every persisted cursor.
pub async fn render_status<S>(config: &Config, storage: &S) -> Result<String, StorageError>
where
    S: BatchStorage + SequenceStorage,
{
    let identifier = &config.device.identifier;
    let mut out = String::new();

    let interval = match storage.get_record_interval(identifier).await? {
        Some(interval) => format_duration(interval).to_string(),
        None => format!(
            "{} (default)",
            format_duration(config.device.default_record_interval)
        ),
    };

    let _ = writeln!(out, "Uploader '{}'", identifier);
    let _ = writeln!(out, "  record interval:   {}", interval);
    for date_type in DateType::ALL {
        let date = storage.get_date(identifier, date_type).await?;
        let _ = writeln!(out, "  {:<18} {}", format!("{}:", date_type), format_date(date));
    }
    let _ = writeln!(
        out,
        "  current records:   {}",
        storage.current_buffer_len(identifier).await?
    );
    let _ = writeln!(
        out,
        "  archived buffers:  {}",
        storage.archived_buffer_count(identifier).await?
    );

    if config.health.is_some() {
        let last_completed = storage.last_completed_uploader().await?;
        let _ = writeln!(out, "Health upload sequence");
        let _ = writeln!(
            out,
            "  last completed:    {}",
            last_completed.as_deref().unwrap_or("-")
        );
        let _ = writeln!(
            out,
            "  last pass start:   {}",
            format_date(storage.last_pass_start().await?)
        );
        let _ = writeln!(
            out,
            "  last pass end:     {}",
            format_date(storage.last_pass_completion().await?)
        );
        let _ = writeln!(
            out,
            "  window start:      {}",
            format_date(storage.upload_window_start().await?)
        );
    }

    Ok(out)
}
