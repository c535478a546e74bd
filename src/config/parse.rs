use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::sequence::HealthDataType;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a config from YAML text, expanding `$env{VAR}` and `~`.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let Some(re) = env_var_pattern() else {
        return Ok(());
    };

    let mut unexpanded_vars: Vec<&str> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort_unstable();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.storage.path = expand_tilde(&config.storage.path);

    if let Some(health) = config.health.as_mut() {
        health.data_dir = expand_tilde(&health.data_dir);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.backend.base_url.trim().is_empty() {
        errors.push("backend.base_url cannot be empty".to_string());
    }

    validate_uploader("device", &config.device, &mut errors);

    if let Some(health) = &config.health {
        validate_health(health, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

/// Check one batch uploader section, prefixing messages with `section`.
pub fn validate_uploader(section: &str, uploader: &BatchUploaderConfig, errors: &mut Vec<String>) {
    if uploader.identifier.trim().is_empty() {
        errors.push(format!("{}.identifier cannot be empty", section));
    }

    if uploader.upload_retry_interval.is_zero() {
        errors.push(format!("{}.upload_retry_interval must be greater than zero", section));
    }

    if uploader.buffer_limit == 0 {
        errors.push(format!("{}.buffer_limit must be at least 1", section));
    }

    if uploader.upload_interval.is_some_and(|interval| interval.is_zero()) {
        errors.push(format!(
            "{}.upload_interval must be greater than zero (omit it to upload every record immediately)",
            section
        ));
    }
}

fn validate_health(health: &HealthConfig, errors: &mut Vec<String>) {
    if health.categories.is_empty() {
        errors.push("health.categories must contain at least one category".to_string());
    }

    if health.chunk_size.is_zero() {
        errors.push("health.chunk_size must be greater than zero".to_string());
    }

    let mut seen = HashSet::new();
    for (i, category) in health.categories.iter().enumerate() {
        if category.parse::<HealthDataType>().is_err() {
            errors.push(format!(
                "health.categories[{}]: unknown category '{}'",
                i, category
            ));
        } else if !seen.insert(category.as_str()) {
            errors.push(format!(
                "health.categories[{}]: duplicate category '{}'",
                i, category
            ));
        }
    }
}
