//! Push request and push job operations against package orgs.

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use serde_json::json;

use super::{
    decode_records, ConnectionCache, GatewayError, PushErrorRecord, PushJobRecord,
    PushRequestRecord, SaveResult, PUSH_ERROR, PUSH_JOB, PUSH_REQUEST,
};
use crate::status::PushStatus;

/// Remote ids compare on their case-sensitive 15 character form.
pub const SHORT_ID_LEN: usize = 15;

/// Returns the 15 character form of a remote id.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// A push request located in its package org.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRef {
    pub package_org_id: String,
    pub push_request_id: String,
}

impl From<&crate::db::item_repo::ItemView> for RequestRef {
    fn from(item: &crate::db::item_repo::ItemView) -> Self {
        Self {
            package_org_id: item.package_org_id.clone(),
            push_request_id: item.push_request_id.clone(),
        }
    }
}

fn quote_list<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v.as_ref().replace('\\', "\\\\").replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(",")
}

fn ensure_remote(status: PushStatus, sobject: &'static str) -> Result<(), GatewayError> {
    if status.is_remote() {
        Ok(())
    } else {
        Err(GatewayError::Rejected {
            sobject,
            id: String::new(),
            message: format!("{} is not a remote status", status),
        })
    }
}

fn check_saved(
    sobject: &'static str,
    ids: &[String],
    results: &[SaveResult],
) -> Result<(), GatewayError> {
    for (id, result) in ids.iter().zip(results) {
        if !result.success {
            return Err(GatewayError::Rejected {
                sobject,
                id: id.clone(),
                message: result.error_text(),
            });
        }
    }
    Ok(())
}

/// Creates a push request for a package version.
pub async fn create_push_request(
    cache: &ConnectionCache,
    package_org_id: &str,
    version_id: &str,
    scheduled: Option<DateTime<Utc>>,
) -> Result<SaveResult, GatewayError> {
    let conn = cache.get(package_org_id).await?;
    let body = json!({
        "PackageVersionId": version_id,
        "ScheduledStartTime": scheduled.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
    });
    let mut results = conn.create(PUSH_REQUEST, vec![body]).await?;
    results
        .pop()
        .ok_or_else(|| GatewayError::Decode("empty save result for push request".to_string()))
}

/// Creates one push job per subscriber org. Results pair with `org_ids`.
pub async fn create_push_jobs(
    cache: &ConnectionCache,
    package_org_id: &str,
    push_request_id: &str,
    org_ids: &[String],
) -> Result<Vec<SaveResult>, GatewayError> {
    if org_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = cache.get(package_org_id).await?;
    let body = org_ids
        .iter()
        .map(|org_id| {
            json!({
                "PackagePushRequestId": push_request_id,
                "SubscriberOrganizationKey": org_id,
            })
        })
        .collect();
    let results = conn.create(PUSH_JOB, body).await?;
    if results.len() != org_ids.len() {
        return Err(GatewayError::Decode(format!(
            "expected {} push job results, got {}",
            org_ids.len(),
            results.len()
        )));
    }
    Ok(results)
}

/// Moves push requests to `status`, one update call per distinct push
/// request, all in flight together.
pub async fn update_push_requests(
    cache: &ConnectionCache,
    requests: &[RequestRef],
    status: PushStatus,
) -> Result<usize, GatewayError> {
    ensure_remote(status, PUSH_REQUEST)?;

    let mut batches: Vec<(&RequestRef, Vec<String>)> = Vec::new();
    for request in requests {
        match batches
            .iter_mut()
            .find(|(r, _)| r.push_request_id == request.push_request_id)
        {
            Some((_, ids)) => ids.push(request.push_request_id.clone()),
            None => batches.push((request, vec![request.push_request_id.clone()])),
        }
    }

    let calls = batches.iter().map(|(request, ids)| async move {
        let conn = cache.get(&request.package_org_id).await?;
        let body = ids
            .iter()
            .map(|id| json!({ "Id": id, "Status": status.as_str() }))
            .collect();
        let results = conn.update(PUSH_REQUEST, body).await?;
        check_saved(PUSH_REQUEST, ids, &results)?;
        Ok::<usize, GatewayError>(results.len())
    });

    let mut updated = 0;
    for outcome in join_all(calls).await {
        updated += outcome?;
    }
    tracing::debug!(updated, status = %status, "updated push requests");
    Ok(updated)
}

/// Moves push jobs of one package org to `status`.
pub async fn update_push_jobs(
    cache: &ConnectionCache,
    package_org_id: &str,
    job_ids: &[String],
    status: PushStatus,
) -> Result<usize, GatewayError> {
    ensure_remote(status, PUSH_JOB)?;
    if job_ids.is_empty() {
        return Ok(0);
    }
    let conn = cache.get(package_org_id).await?;
    let body = job_ids
        .iter()
        .map(|id| json!({ "Id": id, "Status": status.as_str() }))
        .collect();
    let results = conn.update(PUSH_JOB, body).await?;
    check_saved(PUSH_JOB, job_ids, &results)?;
    Ok(results.len())
}

pub async fn find_requests_by_ids(
    cache: &ConnectionCache,
    package_org_id: &str,
    request_ids: &[String],
) -> Result<Vec<PushRequestRecord>, GatewayError> {
    if request_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = cache.get(package_org_id).await?;
    let soql = format!(
        "SELECT Id,PackageVersionId,Status,ScheduledStartTime FROM {} WHERE Id IN ({})",
        PUSH_REQUEST,
        quote_list(request_ids)
    );
    decode_records(conn.query(&soql).await?)
}

pub async fn find_requests_by_status(
    cache: &ConnectionCache,
    package_org_id: &str,
    statuses: &[PushStatus],
) -> Result<Vec<PushRequestRecord>, GatewayError> {
    let conn = cache.get(package_org_id).await?;
    let names: Vec<&str> = statuses.iter().map(PushStatus::as_str).collect();
    let soql = format!(
        "SELECT Id,PackageVersionId,Status,ScheduledStartTime FROM {} WHERE Status IN ({})",
        PUSH_REQUEST,
        quote_list(&names)
    );
    decode_records(conn.query(&soql).await?)
}

pub async fn find_jobs_by_request_ids(
    cache: &ConnectionCache,
    package_org_id: &str,
    request_ids: &[String],
) -> Result<Vec<PushJobRecord>, GatewayError> {
    if request_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = cache.get(package_org_id).await?;
    let soql = format!(
        "SELECT Id,PackagePushRequestId,Status,SubscriberOrganizationKey FROM {} \
         WHERE PackagePushRequestId IN ({})",
        PUSH_JOB,
        quote_list(request_ids)
    );
    decode_records(conn.query(&soql).await?)
}

/// Fetches at most `limit` error records for the given jobs.
pub async fn find_errors_by_job_ids(
    cache: &ConnectionCache,
    package_org_id: &str,
    job_ids: &[String],
    limit: usize,
) -> Result<Vec<PushErrorRecord>, GatewayError> {
    if job_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = cache.get(package_org_id).await?;
    let soql = format!(
        "SELECT Id,ErrorDetails,ErrorMessage,ErrorSeverity,ErrorTitle,ErrorType,PackagePushJobId \
         FROM {} WHERE PackagePushJobId IN ({}) LIMIT {}",
        PUSH_ERROR,
        quote_list(job_ids),
        limit
    );
    let mut errors: Vec<PushErrorRecord> = decode_records(conn.query(&soql).await?)?;
    errors.truncate(limit);
    Ok(errors)
}

/// Cancels every push request still `Created` in the given package orgs.
/// Returns how many were canceled.
pub async fn clear_requests(
    cache: &ConnectionCache,
    package_org_ids: &[String],
) -> Result<usize, GatewayError> {
    let mut canceled = 0;
    for package_org_id in package_org_ids {
        let created =
            find_requests_by_status(cache, package_org_id, &[PushStatus::Created]).await?;
        tracing::info!(package_org_id = %package_org_id, count = created.len(), "canceling created push requests");
        let refs: Vec<RequestRef> = created
            .into_iter()
            .map(|r| RequestRef {
                package_org_id: package_org_id.clone(),
                push_request_id: r.id,
            })
            .collect();
        canceled += update_push_requests(cache, &refs, PushStatus::Canceled).await?;
    }
    Ok(canceled)
}
