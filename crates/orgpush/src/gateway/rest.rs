//! REST implementation of the org connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Connector, GatewayError, OrgConnection, SaveResult};
use crate::config::GatewayConfig;
use crate::error::ConfigError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest error body kept in error values.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// The collections endpoint accepts at most this many records per call.
const MAX_RECORDS_PER_CALL: usize = 200;

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

fn create_http_client() -> Result<Client, GatewayError> {
    Ok(Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default = "default_done")]
    done: bool,
    #[serde(default)]
    next_records_url: Option<String>,
}

fn default_done() -> bool {
    true
}

/// Connection to one org's REST API.
pub struct RestConnection {
    client: Client,
    instance_url: String,
    api_version: String,
    token: SecretString,
}

impl RestConnection {
    pub fn new(
        client: Client,
        instance_url: &str,
        api_version: &str,
        token: SecretString,
    ) -> Self {
        Self {
            client,
            instance_url: instance_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            token,
        }
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/{}/{}",
            self.instance_url, self.api_version, path
        )
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(self.token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn save(
        &self,
        method: Method,
        sobject: &str,
        records: Vec<Value>,
    ) -> Result<Vec<SaveResult>, GatewayError> {
        let url = self.data_url("composite/sobjects");
        let mut results = Vec::with_capacity(records.len());

        for chunk in records.chunks(MAX_RECORDS_PER_CALL) {
            let typed: Vec<Value> = chunk
                .iter()
                .map(|record| {
                    let mut record = record.clone();
                    if let Some(map) = record.as_object_mut() {
                        map.insert("attributes".to_string(), json!({ "type": sobject }));
                    }
                    record
                })
                .collect();
            let body = json!({ "allOrNone": false, "records": typed });
            let value = self.send(method.clone(), &url, Some(&body)).await?;
            let chunk_results: Vec<SaveResult> =
                serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))?;
            results.extend(chunk_results);
        }

        Ok(results)
    }
}

#[async_trait]
impl OrgConnection for RestConnection {
    async fn create(
        &self,
        sobject: &str,
        records: Vec<Value>,
    ) -> Result<Vec<SaveResult>, GatewayError> {
        self.save(Method::POST, sobject, records).await
    }

    async fn update(
        &self,
        sobject: &str,
        records: Vec<Value>,
    ) -> Result<Vec<SaveResult>, GatewayError> {
        self.save(Method::PATCH, sobject, records).await
    }

    async fn query(&self, soql: &str) -> Result<Vec<Value>, GatewayError> {
        let url = reqwest::Url::parse_with_params(&self.data_url("query"), &[("q", soql)])
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        let mut page: QueryResponse = serde_json::from_value(
            self.send(Method::GET, url.as_str(), None).await?,
        )
        .map_err(|e| GatewayError::Decode(e.to_string()))?;

        let mut records = std::mem::take(&mut page.records);
        while !page.done {
            let Some(next) = page.next_records_url.take() else {
                break;
            };
            let next_url = format!("{}{}", self.instance_url, next);
            page = serde_json::from_value(self.send(Method::GET, &next_url, None).await?)
                .map_err(|e| GatewayError::Decode(e.to_string()))?;
            records.append(&mut page.records);
        }
        Ok(records)
    }
}

struct Endpoint {
    instance_url: String,
    token: SecretString,
}

/// Builds REST connections from configured org endpoints.
pub struct RestConnector {
    client: Client,
    api_version: String,
    endpoints: HashMap<String, Endpoint>,
}

impl RestConnector {
    /// Resolves every endpoint's token up front so a missing credential
    /// fails at startup rather than mid-workflow.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let client = create_http_client().map_err(|e| ConfigError::Validation {
            message: format!("Failed to create HTTP client: {}", e),
        })?;

        let mut endpoints = HashMap::new();
        for org in &config.orgs {
            let token = org
                .token
                .resolve()
                .map_err(|source| ConfigError::Credentials {
                    org_id: org.org_id.clone(),
                    source,
                })?;
            endpoints.insert(
                org.org_id.clone(),
                Endpoint {
                    instance_url: org.instance_url.clone(),
                    token,
                },
            );
        }

        log::info!("Configured {} org endpoints", endpoints.len());
        Ok(Self {
            client,
            api_version: config.api_version.clone(),
            endpoints,
        })
    }

    pub fn org_ids(&self) -> Vec<&str> {
        self.endpoints.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn build_connection(
        &self,
        org_id: &str,
    ) -> Result<Arc<dyn OrgConnection>, GatewayError> {
        let endpoint = self
            .endpoints
            .get(org_id)
            .ok_or_else(|| GatewayError::UnknownOrg(org_id.to_string()))?;
        Ok(Arc::new(RestConnection::new(
            self.client.clone(),
            &endpoint.instance_url,
            &self.api_version,
            endpoint.token.clone(),
        )))
    }
}
