pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# BATCHUP CONFIGURATION
# =============================================================================
# batchup captures device telemetry on a fixed cadence, batches it and uploads
# it to a REST backend, and periodically uploads health samples category by
# category. All scheduling state is persisted, so uploads resume where they
# left off after a restart or a loss of connectivity.
#
# Durations use human-readable units: 500ms, 30s, 15m, 1h, 7days.
# Values may reference environment variables with $env{VAR_NAME}.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/batchup/config.yml
#   3. /etc/batchup/config.yml

# =============================================================================
# STORAGE
# =============================================================================
# DuckDB file holding buffers, due-dates, cursors and anchors.

storage:
  path: ~/.local/share/batchup/state.duckdb

# =============================================================================
# BACKEND
# =============================================================================

backend:
  base_url: https://api.example.com
  # Sent as a bearer token when present
  access_token: $env{BATCHUP_ACCESS_TOKEN}
  request_timeout: 30s
  # Tag attached to every health upload
  source: batchup

# =============================================================================
# REACHABILITY
# =============================================================================
# The check URL is requested periodically; any HTTP response counts as
# reachable. Leave check_url empty to assume the backend is always reachable.

reachability:
  check_url: https://api.example.com/health
  check_interval: 30s
  timeout: 5s

# =============================================================================
# DEVICE TELEMETRY
# =============================================================================

device:
  # Partitions all persisted state for this uploader
  identifier: device_data
  # How often a record is captured (0s disables the uploader)
  default_record_interval: 5m
  # How often the current buffer is archived and uploaded. Remove this line
  # to upload every record as soon as it is captured.
  upload_interval: 1h
  # Fixed delay before a failed upload is retried
  upload_retry_interval: 5m
  # Archived buffers kept while offline; the oldest are dropped beyond this
  buffer_limit: 50
  enable_debug_log: false

# =============================================================================
# HEALTH SAMPLES (optional)
# =============================================================================
# Each category is read from <data_dir>/<category>.jsonl, one JSON sample per
# line with "start_date" and "end_date" fields. Categories are uploaded one
# at a time in the order listed.

health:
  sequence_period: 1day
  # How far back the first pass reaches
  lookback: 7days
  chunk_size: 1h
  data_dir: ~/.local/share/batchup/health
  categories:
    - stepCount
    - heartRate
    - restingHeartRate
    - sleepAnalysis
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_starter_config_parses() {
        std::env::set_var("BATCHUP_ACCESS_TOKEN", "starter-token");
        let config = parse_config(&generate_starter_config()).unwrap();
        std::env::remove_var("BATCHUP_ACCESS_TOKEN");

        assert_eq!(config.device.identifier, "device_data");
        let health = config.health.unwrap();
        assert_eq!(health.categories.len(), 4);
    }
}
