pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};

pub use parse::{load_config, parse_config, ConfigError};
pub use types::{
    BackendConfig, BatchUploaderConfig, Config, HealthConfig, ReachabilityConfig, StorageConfig,
};

/// Matches `$env{VAR_NAME}` where VAR_NAME starts with a letter or underscore.
pub(crate) fn env_var_pattern() -> Option<Regex> {
    Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").ok()
}

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    let Some(re) = env_var_pattern() else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &regex::Captures| {
        caps.get(1)
            .and_then(|name| std::env::var(name.as_str()).ok())
            .unwrap_or_else(|| caps[0].to_string())
    })
    .to_string()
}

/// Expands tilde (~) in paths to the user's home directory.
/// Returns the path unchanged if it doesn't start with tilde or home directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/batchup/config.yml
/// 3. /etc/batchup/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(user_config) = default_user_config_path() {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/batchup/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

pub fn default_user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config/batchup/config.yml"))
}
