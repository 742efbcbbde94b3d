//! Remote push gateway.
//!
//! The engine talks to each package org through an [`OrgConnection`]
//! obtained from a [`Connector`]. Workflows hold a [`ConnectionCache`] so a
//! connection is built once per org per invocation and never shared across
//! invocations.

pub mod push;
pub mod rest;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::status::PushStatus;

pub use rest::{RestConnection, RestConnector};

/// Remote object names.
pub const PUSH_REQUEST: &str = "PackagePushRequest";
pub const PUSH_JOB: &str = "PackagePushJob";
pub const PUSH_ERROR: &str = "PackagePushError";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode remote response: {0}")]
    Decode(String),

    #[error("No endpoint configured for org '{0}'")]
    UnknownOrg(String),

    #[error("{sobject} {id} rejected: {message}")]
    Rejected {
        sobject: &'static str,
        id: String,
        message: String,
    },
}

/// One error entry of a per-record save result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Outcome of creating or updating one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    #[serde(default)]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<RecordError>,
}

impl SaveResult {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(status_code: &str, message: &str) -> Self {
        Self {
            id: None,
            success: false,
            errors: vec![RecordError {
                status_code: status_code.to_string(),
                message: message.to_string(),
                fields: Vec::new(),
            }],
        }
    }

    /// All error messages joined for logs.
    pub fn error_text(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.status_code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushRequestRecord {
    pub id: String,
    #[serde(default)]
    pub package_version_id: Option<String>,
    pub status: PushStatus,
    #[serde(default)]
    pub scheduled_start_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushJobRecord {
    pub id: String,
    #[serde(default)]
    pub package_push_request_id: Option<String>,
    pub status: PushStatus,
    #[serde(default)]
    pub subscriber_organization_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushErrorRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_severity: Option<String>,
    #[serde(default)]
    pub error_title: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub package_push_job_id: Option<String>,
}

/// An authenticated session against one org.
#[async_trait]
pub trait OrgConnection: Send + Sync {
    /// Creates records. Results are in input order.
    async fn create(
        &self,
        sobject: &str,
        records: Vec<serde_json::Value>,
    ) -> Result<Vec<SaveResult>, GatewayError>;

    /// Updates records by `Id`. Results are in input order.
    async fn update(
        &self,
        sobject: &str,
        records: Vec<serde_json::Value>,
    ) -> Result<Vec<SaveResult>, GatewayError>;

    /// Runs a query and returns all matching records.
    async fn query(&self, soql: &str) -> Result<Vec<serde_json::Value>, GatewayError>;
}

/// Builds connections by org id.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn build_connection(&self, org_id: &str)
        -> Result<Arc<dyn OrgConnection>, GatewayError>;
}

/// Per-invocation memo of org connections.
///
/// The map lock is only held to find the org's slot. Building happens on the
/// slot itself, so different orgs connect concurrently while callers for the
/// same org wait for a single build.
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn OrgConnection>>>>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the connection for an org, building it on first use. A failed
    /// build leaves the slot empty for the next caller.
    pub async fn get(&self, org_id: &str) -> Result<Arc<dyn OrgConnection>, GatewayError> {
        let slot = {
            let mut connections = self.connections.lock().await;
            Arc::clone(connections.entry(org_id.to_string()).or_default())
        };
        let conn = slot
            .get_or_try_init(|| async {
                tracing::debug!(org_id, "building org connection");
                self.connector.build_connection(org_id).await
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// Number of orgs with a built connection.
    pub async fn len(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

/// Decodes query records into typed rows.
pub(crate) fn decode_records<T: serde::de::DeserializeOwned>(
    records: Vec<serde_json::Value>,
) -> Result<Vec<T>, GatewayError> {
    records
        .into_iter()
        .map(|r| serde_json::from_value(r).map_err(|e| GatewayError::Decode(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullConnection;

    #[async_trait]
    impl OrgConnection for NullConnection {
        async fn create(
            &self,
            _sobject: &str,
            records: Vec<serde_json::Value>,
        ) -> Result<Vec<SaveResult>, GatewayError> {
            Ok(records.iter().map(|_| SaveResult::ok("x")).collect())
        }

        async fn update(
            &self,
            _sobject: &str,
            records: Vec<serde_json::Value>,
        ) -> Result<Vec<SaveResult>, GatewayError> {
            Ok(records.iter().map(|_| SaveResult::ok("x")).collect())
        }

        async fn query(&self, _soql: &str) -> Result<Vec<serde_json::Value>, GatewayError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        built: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn build_connection(
            &self,
            org_id: &str,
        ) -> Result<Arc<dyn OrgConnection>, GatewayError> {
            if org_id == "missing" {
                return Err(GatewayError::UnknownOrg(org_id.to_string()));
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullConnection))
        }
    }

    #[tokio::test]
    async fn test_cache_builds_once_per_org() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector.clone());

        cache.get("00DA").await.unwrap();
        cache.get("00DA").await.unwrap();
        cache.get("00DB").await.unwrap();
        assert_eq!(connector.built.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);

        assert!(matches!(
            cache.get("missing").await,
            Err(GatewayError::UnknownOrg(_))
        ));
    }

    /// Completes only once two builds are in flight at the same time.
    struct RendezvousConnector {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl Connector for RendezvousConnector {
        async fn build_connection(
            &self,
            _org_id: &str,
        ) -> Result<Arc<dyn OrgConnection>, GatewayError> {
            self.barrier.wait().await;
            Ok(Arc::new(NullConnection))
        }
    }

    #[tokio::test]
    async fn test_cache_builds_different_orgs_concurrently() {
        let cache = ConnectionCache::new(Arc::new(RendezvousConnector {
            barrier: tokio::sync::Barrier::new(2),
        }));

        let both = futures_util::future::join(cache.get("00DA"), cache.get("00DB"));
        let (a, b) = tokio::time::timeout(std::time::Duration::from_secs(5), both)
            .await
            .expect("connection builds were serialized");
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector);
        assert!(cache.get("missing").await.is_err());
        assert!(cache.get("missing").await.is_err());
        assert_eq!(cache.len().await, 0);
    }

    #[test]
    fn test_decode_push_job_record() {
        let records = vec![serde_json::json!({
            "attributes": {"type": "PackagePushJob"},
            "Id": "0DXxx0000000001AAA",
            "PackagePushRequestId": "0DVxx",
            "Status": "InProgress",
            "SubscriberOrganizationKey": "00DS"
        })];
        let jobs: Vec<PushJobRecord> = decode_records(records).unwrap();
        assert_eq!(jobs[0].status, PushStatus::InProgress);
        assert_eq!(jobs[0].subscriber_organization_key.as_deref(), Some("00DS"));

        let bad = vec![serde_json::json!({"Id": "x", "Status": "Exploded"})];
        assert!(decode_records::<PushJobRecord>(bad).is_err());
    }

    #[test]
    fn test_save_result_error_text() {
        let result = SaveResult::failed("INVALID_OPERATION", "org not eligible");
        assert_eq!(result.error_text(), "INVALID_OPERATION: org not eligible");
    }
}
