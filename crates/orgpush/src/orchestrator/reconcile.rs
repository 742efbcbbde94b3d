//! Pull-back of remote push request and push job status.

use std::collections::HashMap;

use futures_util::future::join_all;

use super::{encode_job_errors, JobErrorEntry, Orchestrator};
use crate::broadcast::{JobChange, UpgradeEvent};
use crate::db::item_repo::ItemView;
use crate::db::job_repo::{self, JobUpdate, JobView};
use crate::error::{OrgPushError, Result};
use crate::gateway::push::{self, short_id, SHORT_ID_LEN};
use crate::gateway::{ConnectionCache, PushErrorRecord, PushJobRecord};
use crate::status::PushStatus;

/// Upper bound of remote error records pulled per failed job.
pub const MAX_ERROR_COUNT: usize = 20;

pub const INELIGIBLE_ORG_MESSAGE: &str = "No matching push upgrade job found. Most likely cause is \
the org is not eligible to receive this upgrade. It may not have the package installed, or it may \
have a beta version installed.";

pub const UNKNOWN_FAILURE_TITLE: &str = "Unknown failure";

pub const UNKNOWN_FAILURE_MESSAGE: &str =
    "Unknown failure. No error message given from push upgrade API.";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ItemStatusCounts {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobStatusCounts {
    pub updated: usize,
    pub succeeded: usize,
    pub errored: usize,
}

/// What one reconciliation step decided for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing to write.
    Unchanged,
    /// No remote job was ever created for this org.
    Invalid,
    /// The remote org has no record of the job.
    Missing { message: String },
    /// Remote reports `Failed`; error details still to be pulled.
    Errored,
    Succeeded,
    Status(PushStatus),
}

/// Classifies a local job against the remote record found for it.
///
/// A remote record whose id disagrees with the local one means the lookup
/// paired the wrong rows. That is an integrity failure and stops the batch.
pub fn classify_job(job: &JobView, remote: Option<&PushJobRecord>) -> Result<JobOutcome> {
    let job_id = match job.job_id.as_deref() {
        None if job.status == PushStatus::Invalid => return Ok(JobOutcome::Unchanged),
        None => return Ok(JobOutcome::Invalid),
        Some(job_id) => job_id,
    };

    let remote = match remote {
        Some(remote) => remote,
        None => {
            let entry = JobErrorEntry::new(
                UNKNOWN_FAILURE_TITLE,
                "",
                format!(
                    "Something is very wrong.  No push job found for upgrade job. \
                     upgrade_job.job_id: {}, upgrade_job.id: {}.",
                    job_id, job.id
                ),
            );
            return Ok(JobOutcome::Missing {
                message: encode_job_errors(&[entry]),
            });
        }
    };

    let mismatch = if remote.id.len() > SHORT_ID_LEN && job_id.len() > SHORT_ID_LEN {
        remote.id != job_id
    } else {
        short_id(&remote.id) != short_id(job_id)
    };
    if mismatch {
        return Err(OrgPushError::Consistency(format!(
            "push job {} returned for upgrade job {} with job_id {}",
            remote.id, job.id, job_id
        )));
    }

    Ok(match remote.status {
        status if status == job.status => JobOutcome::Unchanged,
        PushStatus::Failed => JobOutcome::Errored,
        PushStatus::Succeeded => JobOutcome::Succeeded,
        status => JobOutcome::Status(status),
    })
}

/// Message for a failed job: the remote errors when there are any,
/// otherwise the existing message, otherwise a generic error entry.
pub fn failure_message(existing: Option<&str>, errors: &[PushErrorRecord]) -> String {
    if errors.is_empty() {
        return match existing {
            Some(message) => message.to_string(),
            None => encode_job_errors(&[JobErrorEntry::new(
                UNKNOWN_FAILURE_TITLE,
                "",
                UNKNOWN_FAILURE_MESSAGE,
            )]),
        };
    }
    let entries: Vec<JobErrorEntry> = errors
        .iter()
        .map(|e| JobErrorEntry {
            title: e.error_title.clone().unwrap_or_default(),
            details: e.error_details.clone().unwrap_or_default(),
            message: e.error_message.clone().unwrap_or_default(),
        })
        .collect();
    encode_job_errors(&entries)
}

struct JobWrite<'a> {
    job: &'a JobView,
    message: Option<String>,
}

impl Orchestrator {
    /// Writes back the remote status of running items.
    ///
    /// Items of one package org are looked up together. A failing org is
    /// logged and its items are counted as failed; the others still update.
    pub async fn fetch_status(&self, items: &[ItemView]) -> Result<ItemStatusCounts> {
        let running: Vec<&ItemView> = items
            .iter()
            .filter(|item| PushStatus::RUNNING.contains(&item.status))
            .collect();
        let mut counts = ItemStatusCounts {
            checked: running.len(),
            ..Default::default()
        };
        if running.is_empty() {
            return Ok(counts);
        }

        let mut by_org: HashMap<&str, Vec<&ItemView>> = HashMap::new();
        for item in &running {
            by_org
                .entry(item.package_org_id.as_str())
                .or_default()
                .push(*item);
        }

        let cache = self.connections();
        let lookups = by_org.into_iter().map(|(org, items)| {
            let cache = &cache;
            async move {
                let ids: Vec<String> = items.iter().map(|i| i.push_request_id.clone()).collect();
                let found = push::find_requests_by_ids(cache, org, &ids).await;
                (org, items, found)
            }
        });

        for (org, items, found) in join_all(lookups).await {
            let records = match found {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!(package_org_id = org, error = %e, "cannot fetch push request status");
                    counts.failed += items.len();
                    continue;
                }
            };
            let remote: HashMap<&str, PushStatus> = records
                .iter()
                .map(|r| (short_id(&r.id), r.status))
                .collect();

            for item in items {
                let Some(status) = remote.get(short_id(&item.push_request_id)).copied() else {
                    tracing::warn!(
                        item_id = item.id,
                        push_request_id = %item.push_request_id,
                        "push request not found in package org"
                    );
                    continue;
                };
                if status == item.status {
                    continue;
                }
                match self.change_item_status(item, status) {
                    Ok(()) => counts.updated += 1,
                    Err(e) => {
                        tracing::error!(item_id = item.id, error = %e, "cannot update item status");
                        counts.failed += 1;
                    }
                }
            }
        }

        Ok(counts)
    }

    /// Writes back the remote status of active jobs.
    ///
    /// Jobs are looked up per push request, all requests in flight together.
    /// Failed jobs get their remote error details as message. An existing
    /// message is only replaced when the remote reports errors. A remote id
    /// that disagrees with the local one aborts the whole batch with
    /// [`OrgPushError::Consistency`] before anything is written.
    pub async fn fetch_job_status(&self, jobs: &[JobView]) -> Result<JobStatusCounts> {
        let active: Vec<&JobView> = jobs.iter().filter(|j| j.status.is_active()).collect();
        let mut counts = JobStatusCounts::default();
        if active.is_empty() {
            return Ok(counts);
        }

        let cache = self.connections();
        let remote = self.fetch_remote_jobs(&cache, &active).await;

        let mut updates: Vec<JobWrite<'_>> = Vec::new();
        let mut updated_status: Vec<PushStatus> = Vec::new();
        let mut errored: Vec<JobWrite<'_>> = Vec::new();
        let mut succeeded: Vec<&JobView> = Vec::new();

        for job in active {
            let found = match (&job.job_id, remote.get(&job.push_request_id)) {
                (Some(_), None) => continue,
                (Some(job_id), Some(records)) => records.get(short_id(job_id)),
                (None, _) => None,
            };
            match classify_job(job, found)? {
                JobOutcome::Unchanged => {}
                JobOutcome::Invalid => {
                    updates.push(JobWrite {
                        job,
                        message: Some(INELIGIBLE_ORG_MESSAGE.to_string()),
                    });
                    updated_status.push(PushStatus::Invalid);
                }
                JobOutcome::Missing { message } => {
                    tracing::error!(job_id = job.id, "push job missing in package org");
                    errored.push(JobWrite {
                        job,
                        message: Some(message),
                    });
                }
                JobOutcome::Errored => errored.push(JobWrite {
                    job,
                    message: job.message.clone(),
                }),
                JobOutcome::Succeeded => {
                    succeeded.push(job);
                    updates.push(JobWrite {
                        job,
                        message: job.message.clone(),
                    });
                    updated_status.push(PushStatus::Succeeded);
                }
                JobOutcome::Status(status) => {
                    updates.push(JobWrite {
                        job,
                        message: job.message.clone(),
                    });
                    updated_status.push(status);
                }
            }
        }

        counts.errored = errored.len();
        counts.succeeded = succeeded.len();

        for failed in self.enrich_errored(&cache, errored).await {
            updates.push(failed);
            updated_status.push(PushStatus::Failed);
        }
        counts.updated = updates.len();

        if !succeeded.is_empty() {
            let installed: Vec<JobView> = succeeded.into_iter().cloned().collect();
            self.installs.record_succeeded_installs(&installed)?;
        }

        let rows: Vec<JobUpdate> = updates
            .iter()
            .zip(&updated_status)
            .map(|(u, status)| JobUpdate {
                id: u.job.id,
                status: *status,
                message: u.message.clone(),
            })
            .collect();
        job_repo::update_statuses(&self.db, &rows)?;

        if !rows.is_empty() {
            let changes = updates
                .iter()
                .zip(&rows)
                .map(|(u, row)| JobChange {
                    id: row.id,
                    item_id: u.job.item_id,
                    org_id: u.job.org_id.clone(),
                    status: row.status,
                    message: row.message.clone(),
                })
                .collect();
            self.events.send(UpgradeEvent::UpgradeJobs(changes));
        }

        tracing::info!(
            updated = counts.updated,
            succeeded = counts.succeeded,
            errored = counts.errored,
            "reconciled push job status"
        );
        Ok(counts)
    }

    /// Remote jobs by push request id, then by short job id. Requests whose
    /// lookup failed are absent.
    async fn fetch_remote_jobs(
        &self,
        cache: &ConnectionCache,
        jobs: &[&JobView],
    ) -> HashMap<String, HashMap<String, PushJobRecord>> {
        let mut requests: Vec<(&str, &str)> = Vec::new();
        for job in jobs.iter().filter(|j| j.job_id.is_some()) {
            let key = (job.package_org_id.as_str(), job.push_request_id.as_str());
            if !requests.contains(&key) {
                requests.push(key);
            }
        }

        let lookups = requests.into_iter().map(|(org, request_id)| async move {
            let found = push::find_jobs_by_request_ids(cache, org, &[request_id.to_string()]).await;
            (org, request_id, found)
        });

        let mut remote = HashMap::new();
        for (org, request_id, found) in join_all(lookups).await {
            match found {
                Ok(records) => {
                    let by_job = records
                        .into_iter()
                        .map(|r| (short_id(&r.id).to_string(), r))
                        .collect();
                    remote.insert(request_id.to_string(), by_job);
                }
                Err(e) => tracing::error!(
                    package_org_id = org,
                    push_request_id = request_id,
                    error = %e,
                    "cannot fetch push job status; skipping its jobs"
                ),
            }
        }
        remote
    }

    /// Pulls remote error details for failed jobs.
    async fn enrich_errored<'a>(
        &self,
        cache: &ConnectionCache,
        errored: Vec<JobWrite<'a>>,
    ) -> Vec<JobWrite<'a>> {
        let lookups = errored.into_iter().map(|pending| async move {
            let errors = match pending.job.job_id.as_deref() {
                Some(job_id) => push::find_errors_by_job_ids(
                    cache,
                    &pending.job.package_org_id,
                    &[job_id.to_string()],
                    MAX_ERROR_COUNT,
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(job_id = pending.job.id, error = %e, "cannot fetch push errors");
                    Vec::new()
                }),
                None => Vec::new(),
            };
            let message = failure_message(pending.message.as_deref(), &errors);
            JobWrite {
                job: pending.job,
                message: Some(message),
            }
        });
        join_all(lookups).await
    }
}
