use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::schema::EngineConfig;
use crate::error::ConfigError;

pub const ENV_ENFORCE_POLICY: &str = "ORGPUSH_ENFORCE_ACTIVATION_POLICY";
/// Unprefixed name kept for existing deployments.
pub const ENV_ENFORCE_POLICY_LEGACY: &str = "ENFORCE_ACTIVATION_POLICY";
pub const ENV_DATABASE_PATH: &str = "ORGPUSH_DATABASE_PATH";
pub const ENV_MONITOR_INTERVAL: &str = "ORGPUSH_MONITOR_INTERVAL_SECS";

/// Loads a config file, validates it and applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let mut config: EngineConfig = serde_json::from_str(content)?;
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Defaults plus environment overrides, for running without a file.
pub fn load_config_from_env() -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::default();
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut EngineConfig) -> Result<(), ConfigError> {
    let policy = std::env::var(ENV_ENFORCE_POLICY)
        .or_else(|_| std::env::var(ENV_ENFORCE_POLICY_LEGACY))
        .ok();
    if let Some(value) = policy {
        // Only the literal "false" turns the policy off.
        config.enforce_activation_policy = value.trim() != "false";
    }

    if let Ok(value) = std::env::var(ENV_DATABASE_PATH) {
        if !value.trim().is_empty() {
            config.database_path = Some(PathBuf::from(value.trim()));
        }
    }

    if let Ok(value) = std::env::var(ENV_MONITOR_INTERVAL) {
        config.monitor_interval_secs =
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_MONITOR_INTERVAL,
                    value: value.clone(),
                })?;
    }

    Ok(())
}

fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.monitor_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "monitor_interval_secs must be greater than zero".to_string(),
        });
    }

    if config.event_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "event_capacity must be greater than zero".to_string(),
        });
    }

    let mut org_ids = HashSet::new();
    for org in &config.gateway.orgs {
        if org.org_id.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "org endpoint with empty org_id".to_string(),
            });
        }
        if !org_ids.insert(org.org_id.as_str()) {
            return Err(ConfigError::Validation {
                message: format!("Duplicate org endpoint '{}'", org.org_id),
            });
        }
        if !(org.instance_url.starts_with("https://") || org.instance_url.starts_with("http://"))
        {
            return Err(ConfigError::Validation {
                message: format!(
                    "Org '{}' instance_url must be an http(s) URL, got '{}'",
                    org.org_id, org.instance_url
                ),
            });
        }
        if !org.token.is_configured() {
            return Err(ConfigError::Validation {
                message: format!("Org '{}' has no access token source", org.org_id),
            });
        }
    }

    Ok(())
}
