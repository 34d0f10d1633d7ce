use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Returns the default config location: `~/.mediascribe/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mediascribe").join("config.yaml"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Loads an explicitly requested file, or the default location when none
/// was given. A missing default file falls back to built-in defaults.
pub fn load_config_or_default(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = explicit {
        return load_config(path);
    }

    let default_path = default_config_path().ok_or(ConfigError::NoHomeDirectory)?;
    if default_path.exists() {
        load_config(&default_path)
    } else {
        log::info!(
            "No config at {}, using built-in defaults",
            default_path.display()
        );
        let config = Config::default();
        validate_config(&config)?;
        Ok(config)
    }
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(content)?
    };

    validate_config(&config)?;

    Ok(config)
}

/// Upper bound for the success and retry windows: a century.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

/// Upper bound for a lease: one week.
const MAX_LEASE_TTL_SECS: u64 = 7 * 24 * 3600;

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.catalog.lease_ttl_secs == 0 || config.catalog.lease_ttl_secs > MAX_LEASE_TTL_SECS {
        return Err(ConfigError::Validation {
            message: format!(
                "catalog.lease_ttl_secs must be between 1 and {}",
                MAX_LEASE_TTL_SECS
            ),
        });
    }

    if config.dispatch.success_freshness_hours > MAX_WINDOW_SECS / 3600 {
        return Err(ConfigError::Validation {
            message: format!(
                "dispatch.success_freshness_hours must be at most {}",
                MAX_WINDOW_SECS / 3600
            ),
        });
    }

    if config.dispatch.retry_failed_after_secs > MAX_WINDOW_SECS {
        return Err(ConfigError::Validation {
            message: format!(
                "dispatch.retry_failed_after_secs must be at most {}",
                MAX_WINDOW_SECS
            ),
        });
    }

    if config.dispatch.max_parallel_workers == 0 {
        return Err(ConfigError::Validation {
            message: "dispatch.max_parallel_workers must be at least 1".to_string(),
        });
    }

    if config.dispatch.batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "dispatch.batch_size must be at least 1".to_string(),
        });
    }

    if config.dispatch.max_pool_faults == 0 {
        return Err(ConfigError::Validation {
            message: "dispatch.max_pool_faults must be at least 1".to_string(),
        });
    }

    Ok(())
}
