use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::secrets::TokenSource;

pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_API_VERSION: &str = "v58.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Falls back to `~/.orgpush/data/orgpush.db` when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Rejects activation by the scheduler of an upgrade.
    #[serde(default = "default_true")]
    pub enforce_activation_policy: bool,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            enforce_activation_policy: true,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            gateway: GatewayConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn monitor_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

/// Remote push API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub orgs: Vec<OrgEndpoint>,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            orgs: Vec::new(),
        }
    }
}

/// One package org the engine may call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgEndpoint {
    pub org_id: String,
    pub instance_url: String,
    #[serde(flatten)]
    pub token: TokenSource,
}
