use std::path::PathBuf;
use thiserror::Error;

use crate::status::{PushStatus, UpgradeStatus};

#[derive(Error, Debug)]
pub enum OrgPushError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Remote error: {0}")]
    Remote(#[from] crate::gateway::GatewayError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local and remote state disagree in a way that must stop the batch.
    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Cannot find {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },
}

impl OrgPushError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        OrgPushError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Rejected requests. Nothing has been written when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cannot {action} upgrade {id} in {status} state")]
    InvalidState {
        id: i64,
        action: &'static str,
        status: UpgradeStatus,
    },

    #[error("Cannot {action} item {id} in {status} state")]
    InvalidItemState {
        id: i64,
        action: &'static str,
        status: PushStatus,
    },

    #[error("Cannot {action} job {id} in {status} state")]
    InvalidJobState {
        id: i64,
        action: &'static str,
        status: PushStatus,
    },

    #[error("Activation policy violation on upgrade {id}: {reason}")]
    PolicyViolation { id: i64, reason: String },

    #[error("Upgrade {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: UpgradeStatus,
        to: UpgradeStatus,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Credentials for org '{org_id}': {source}")]
    Credentials {
        org_id: String,
        #[source]
        source: crate::secrets::SecretError,
    },
}

pub type Result<T> = std::result::Result<T, OrgPushError>;
