//! In-memory stand-in for package orgs and their push API.
//!
//! `FakeConnector` hands out one `FakeOrg` per org id. Each org keeps push
//! requests, push jobs and push errors in memory and logs every call so
//! tests can assert on remote traffic.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use orgpush::gateway::{
    Connector, GatewayError, OrgConnection, SaveResult, PUSH_ERROR, PUSH_JOB, PUSH_REQUEST,
};
use orgpush::PushStatus;

/// One logged remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub sobject: String,
    pub records: usize,
}

#[derive(Debug, Clone)]
struct FakeRequest {
    version_id: String,
    status: PushStatus,
}

#[derive(Debug, Clone)]
struct FakeJob {
    request_id: String,
    org_id: String,
    status: PushStatus,
}

#[derive(Debug, Clone)]
struct FakeError {
    job_id: String,
    title: String,
    details: String,
    message: String,
}

/// Remote ids are unique across orgs.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn new_id(prefix: &str) -> String {
    format!("{}{:012}AAA", prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Default)]
struct OrgState {
    requests: HashMap<String, FakeRequest>,
    jobs: HashMap<String, FakeJob>,
    errors: Vec<FakeError>,
    rejected_orgs: HashSet<String>,
    reject_requests: bool,
    rejected_updates: HashSet<String>,
    calls: Vec<Call>,
}

/// A package org with an in-memory push API.
#[derive(Default)]
pub struct FakeOrg {
    state: Mutex<OrgState>,
}

impl FakeOrg {
    /// Push job creation for `org_id` fails per record.
    pub fn reject_subscriber(&self, org_id: &str) {
        self.state.lock().unwrap().rejected_orgs.insert(org_id.to_string());
    }

    /// Push request creation fails per record.
    pub fn reject_requests(&self) {
        self.state.lock().unwrap().reject_requests = true;
    }

    /// Updates of this record fail per record.
    pub fn reject_update_of(&self, id: &str) {
        self.state.lock().unwrap().rejected_updates.insert(id.to_string());
    }

    pub fn accept_updates(&self) {
        self.state.lock().unwrap().rejected_updates.clear();
    }

    pub fn request_status(&self, request_id: &str) -> Option<PushStatus> {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(request_id)
            .map(|r| r.status)
    }

    pub fn job_status(&self, job_id: &str) -> Option<PushStatus> {
        self.state.lock().unwrap().jobs.get(job_id).map(|j| j.status)
    }

    pub fn request_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().requests.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn job_ids(&self, request_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|(_, j)| j.request_id == request_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn set_job_status(&self, job_id: &str, status: PushStatus) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    /// Sets a push request and all of its jobs to `status`.
    pub fn finish_request(&self, request_id: &str, status: PushStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(request) = state.requests.get_mut(request_id) {
            request.status = status;
        }
        for job in state.jobs.values_mut() {
            if job.request_id == request_id {
                job.status = status;
            }
        }
    }

    pub fn add_error(&self, job_id: &str, title: &str, details: &str, message: &str) {
        self.state.lock().unwrap().errors.push(FakeError {
            job_id: job_id.to_string(),
            title: title.to_string(),
            details: details.to_string(),
            message: message.to_string(),
        });
    }

    /// Forgets a push job, as if it was deleted remotely.
    pub fn remove_job(&self, job_id: &str) {
        self.state.lock().unwrap().jobs.remove(job_id);
    }

    /// Re-keys a push job under another id.
    pub fn replace_job_id(&self, job_id: &str, new_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.remove(job_id) {
            state.jobs.insert(new_id.to_string(), job);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn update_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.op == "update").count()
    }
}

/// Values inside the `IN (...)` list of a query.
fn in_values(soql: &str) -> Vec<String> {
    let Some(start) = soql.find("IN (") else {
        return Vec::new();
    };
    let rest = &soql[start + 4..];
    let end = rest.find(')').unwrap_or(rest.len());
    rest[..end]
        .split(',')
        .map(|v| v.trim().trim_matches('\'').to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn field<'a>(record: &'a Value, name: &str) -> Option<&'a str> {
    record.get(name).and_then(Value::as_str)
}

fn parse_status(record: &Value) -> Option<PushStatus> {
    field(record, "Status").and_then(|s| s.parse().ok())
}

#[async_trait]
impl OrgConnection for FakeOrg {
    async fn create(
        &self,
        sobject: &str,
        records: Vec<Value>,
    ) -> Result<Vec<SaveResult>, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op: "create",
            sobject: sobject.to_string(),
            records: records.len(),
        });

        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            let result = match sobject {
                PUSH_REQUEST if state.reject_requests => {
                    SaveResult::failed("UNKNOWN_EXCEPTION", "push request rejected")
                }
                PUSH_REQUEST => {
                    let id = new_id("0DV");
                    let version_id = field(record, "PackageVersionId").unwrap_or_default();
                    state.requests.insert(
                        id.clone(),
                        FakeRequest {
                            version_id: version_id.to_string(),
                            status: PushStatus::Created,
                        },
                    );
                    SaveResult::ok(id)
                }
                PUSH_JOB => {
                    let org_id = field(record, "SubscriberOrganizationKey")
                        .unwrap_or_default()
                        .to_string();
                    if state.rejected_orgs.contains(&org_id) {
                        SaveResult::failed("INVALID_OPERATION", "org is not subscribed")
                    } else {
                        let id = new_id("0DX");
                        let request_id = field(record, "PackagePushRequestId")
                            .unwrap_or_default()
                            .to_string();
                        state.jobs.insert(
                            id.clone(),
                            FakeJob {
                                request_id,
                                org_id,
                                status: PushStatus::Created,
                            },
                        );
                        SaveResult::ok(id)
                    }
                }
                other => SaveResult::failed("INVALID_TYPE", &format!("cannot create {}", other)),
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn update(
        &self,
        sobject: &str,
        records: Vec<Value>,
    ) -> Result<Vec<SaveResult>, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op: "update",
            sobject: sobject.to_string(),
            records: records.len(),
        });

        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            let id = field(record, "Id").unwrap_or_default().to_string();
            let status = parse_status(record);
            if state.rejected_updates.contains(&id) {
                results.push(SaveResult::failed("UNABLE_TO_LOCK_ROW", "record is locked"));
                continue;
            }
            let found = match (sobject, status) {
                (PUSH_REQUEST, Some(status)) => {
                    let found = state
                        .requests
                        .get_mut(&id)
                        .map(|r| r.status = status)
                        .is_some();
                    // Jobs follow their request until they start on their own.
                    for job in state.jobs.values_mut().filter(|j| j.request_id == id) {
                        if job.status == PushStatus::Created
                            || (status == PushStatus::Canceled && job.status.is_active())
                        {
                            job.status = status;
                        }
                    }
                    found
                }
                (PUSH_JOB, Some(status)) => {
                    state.jobs.get_mut(&id).map(|j| j.status = status).is_some()
                }
                _ => false,
            };
            results.push(if found {
                SaveResult::ok(id)
            } else {
                SaveResult::failed("ENTITY_IS_DELETED", "record not found")
            });
        }
        Ok(results)
    }

    async fn query(&self, soql: &str) -> Result<Vec<Value>, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op: "query",
            sobject: soql.to_string(),
            records: 0,
        });
        let values = in_values(soql);

        let records = if soql.contains(&format!("FROM {} ", PUSH_REQUEST)) {
            let by_status = soql.contains("WHERE Status IN");
            state
                .requests
                .iter()
                .filter(|(id, r)| {
                    if by_status {
                        values.iter().any(|v| v == r.status.as_str())
                    } else {
                        values.contains(*id)
                    }
                })
                .map(|(id, r)| {
                    json!({
                        "Id": id,
                        "PackageVersionId": r.version_id,
                        "Status": r.status.as_str(),
                        "ScheduledStartTime": null,
                    })
                })
                .collect()
        } else if soql.contains(&format!("FROM {} ", PUSH_JOB)) {
            state
                .jobs
                .iter()
                .filter(|(_, j)| values.contains(&j.request_id))
                .map(|(id, j)| {
                    json!({
                        "Id": id,
                        "PackagePushRequestId": j.request_id,
                        "Status": j.status.as_str(),
                        "SubscriberOrganizationKey": j.org_id,
                    })
                })
                .collect()
        } else if soql.contains(&format!("FROM {} ", PUSH_ERROR)) {
            state
                .errors
                .iter()
                .filter(|e| values.contains(&e.job_id))
                .map(|e| {
                    json!({
                        "ErrorTitle": e.title,
                        "ErrorDetails": e.details,
                        "ErrorMessage": e.message,
                        "PackagePushJobId": e.job_id,
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(records)
    }
}

/// Connector over a fixed set of fake orgs. Unknown org ids fail.
#[derive(Default)]
pub struct FakeConnector {
    orgs: Mutex<HashMap<String, Arc<FakeOrg>>>,
    unreachable: Mutex<HashSet<String>>,
    builds: Mutex<usize>,
}

impl FakeConnector {
    /// Registers an org and returns it.
    pub fn add_org(&self, org_id: &str) -> Arc<FakeOrg> {
        let org = Arc::new(FakeOrg::default());
        self.orgs
            .lock()
            .unwrap()
            .insert(org_id.to_string(), Arc::clone(&org));
        org
    }

    pub fn org(&self, org_id: &str) -> Arc<FakeOrg> {
        Arc::clone(
            self.orgs
                .lock()
                .unwrap()
                .get(org_id)
                .expect("org not registered"),
        )
    }

    /// Connecting to `org_id` fails until [`FakeConnector::restore`].
    pub fn fail_connections(&self, org_id: &str) {
        self.unreachable.lock().unwrap().insert(org_id.to_string());
    }

    pub fn restore(&self, org_id: &str) {
        self.unreachable.lock().unwrap().remove(org_id);
    }

    pub fn connections_built(&self) -> usize {
        *self.builds.lock().unwrap()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn build_connection(&self, org_id: &str) -> Result<Arc<dyn OrgConnection>, GatewayError> {
        if self.unreachable.lock().unwrap().contains(org_id) {
            return Err(GatewayError::Status {
                status: 401,
                body: "INVALID_SESSION_ID".to_string(),
            });
        }
        *self.builds.lock().unwrap() += 1;
        let org: Arc<dyn OrgConnection> = self
            .orgs
            .lock()
            .unwrap()
            .get(org_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownOrg(org_id.to_string()))?;
        Ok(org)
    }
}
