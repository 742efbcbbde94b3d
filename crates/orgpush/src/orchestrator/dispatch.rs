//! Push dispatch: turns push targets into remote push requests and jobs and
//! records them as an upgrade.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::reporter::JobReporter;
use super::{encode_job_errors, JobErrorEntry, Orchestrator};
use crate::db::catalog_repo;
use crate::db::job_repo::{JobFilter, NewJob};
use crate::db::query::JobSort;
use crate::db::upgrade_repo::UpgradeView;
use crate::db::SortDir;
use crate::error::Result;
use crate::gateway::push;
use crate::gateway::{ConnectionCache, SaveResult};
use crate::logging::upgrade_span;
use crate::status::{PushStatus, UpgradeStatus};

/// One package version to push to a set of subscriber orgs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    pub package_org_id: String,
    pub version_id: String,
    pub org_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub start_time: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub description: Option<String>,
    /// Orgs that must not receive any push job of this upgrade.
    #[serde(default)]
    pub blacklist: Vec<String>,
    pub targets: Vec<PushTarget>,
}

/// A subscriber org that should get a package version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgVersionRow {
    pub package_org_id: String,
    pub version_id: String,
    pub org_id: String,
}

/// Groups rows into one target per (package org, version), in order of
/// first appearance. Duplicate orgs are dropped.
pub fn group_targets(rows: &[OrgVersionRow]) -> Vec<PushTarget> {
    let mut targets: Vec<PushTarget> = Vec::new();
    for row in rows {
        let existing = targets
            .iter_mut()
            .find(|t| t.package_org_id == row.package_org_id && t.version_id == row.version_id);
        match existing {
            Some(target) => {
                if !target.org_ids.contains(&row.org_id) {
                    target.org_ids.push(row.org_id.clone());
                }
            }
            None => targets.push(PushTarget {
                package_org_id: row.package_org_id.clone(),
                version_id: row.version_id.clone(),
                org_ids: vec![row.org_id.clone()],
            }),
        }
    }
    targets
}

fn save_errors(result: &SaveResult) -> String {
    let entries: Vec<JobErrorEntry> = result
        .errors
        .iter()
        .map(|e| JobErrorEntry::new(&e.status_code, &e.fields.join(", "), e.message.clone()))
        .collect();
    encode_job_errors(&entries)
}

impl Orchestrator {
    /// Schedules an upgrade: one push request and item per target, one push
    /// job per subscriber org that is not blacklisted.
    ///
    /// A remote failure while creating push requests or jobs marks the
    /// upgrade `Failed` and the returned view reports it; what was created
    /// until then stays recorded.
    pub async fn schedule_upgrade(&self, request: &ScheduleRequest) -> Result<UpgradeView> {
        let upgrade = self
            .create_upgrade(
                request.start_time,
                request.created_by.as_deref(),
                request.description.as_deref(),
                &request.blacklist,
            )
            .await?;
        let upgrade_id = upgrade.id;

        async {
            let blacklist: HashSet<&str> = request.blacklist.iter().map(String::as_str).collect();
            let cache = self.connections();
            for target in &request.targets {
                if let Err(reason) = self
                    .dispatch_target(&cache, upgrade_id, request, target, &blacklist)
                    .await?
                {
                    self.fail_upgrade(upgrade_id, &reason)?;
                    return self.get_upgrade(upgrade_id);
                }
            }
            tracing::info!(targets = request.targets.len(), "scheduled upgrade");
            self.get_upgrade(upgrade_id)
        }
        .instrument(upgrade_span("schedule", upgrade_id))
        .await
    }

    /// Creates the push request, item and jobs of one target. The inner
    /// error carries a remote failure that should fail the upgrade.
    async fn dispatch_target(
        &self,
        cache: &ConnectionCache,
        upgrade_id: i64,
        request: &ScheduleRequest,
        target: &PushTarget,
        blacklist: &HashSet<&str>,
    ) -> Result<std::result::Result<(), String>> {
        let saved = match push::create_push_request(
            cache,
            &target.package_org_id,
            &target.version_id,
            request.start_time,
        )
        .await
        {
            Ok(saved) => saved,
            Err(e) => return Ok(Err(format!("Cannot create push request: {}", e))),
        };
        let push_request_id = match (&saved.id, saved.success) {
            (Some(id), true) => id.clone(),
            _ => {
                return Ok(Err(format!(
                    "Cannot create push request: {}",
                    saved.error_text()
                )))
            }
        };

        let item_id = self.create_upgrade_item(
            upgrade_id,
            &push_request_id,
            &target.package_org_id,
            &target.version_id,
            request.start_time,
            PushStatus::Created,
            request.created_by.as_deref(),
            target.org_ids.len() as i64,
        )?;

        let mut org_ids: Vec<String> = Vec::with_capacity(target.org_ids.len());
        for org_id in &target.org_ids {
            if !blacklist.contains(org_id.as_str()) && !org_ids.contains(org_id) {
                org_ids.push(org_id.clone());
            }
        }

        let results =
            match push::create_push_jobs(cache, &target.package_org_id, &push_request_id, &org_ids)
                .await
            {
                Ok(results) => results,
                Err(e) => return Ok(Err(format!("Cannot create push jobs: {}", e))),
            };

        let package_id = catalog_repo::find_version(&self.db, &target.version_id)?
            .map(|version| version.package_id);

        let mut jobs = Vec::with_capacity(results.len());
        for (org_id, result) in org_ids.iter().zip(&results) {
            let original_version_id = match &package_id {
                Some(package_id) => {
                    catalog_repo::find_installed_version(&self.db, org_id, package_id)?
                }
                None => None,
            };
            let job = match (&result.id, result.success) {
                (Some(job_id), true) => NewJob {
                    job_id: Some(job_id.clone()),
                    org_id: org_id.clone(),
                    status: PushStatus::Created,
                    message: None,
                    original_version_id,
                },
                _ => {
                    tracing::warn!(org_id = %org_id, error = %result.error_text(), "push job rejected");
                    NewJob {
                        job_id: None,
                        org_id: org_id.clone(),
                        status: PushStatus::Ineligible,
                        message: Some(save_errors(result)),
                        original_version_id,
                    }
                }
            };
            jobs.push(job);
        }

        self.create_upgrade_jobs(upgrade_id, item_id, &push_request_id, &jobs)?;
        if jobs.len() != target.org_ids.len() {
            self.change_item_total_job_count(item_id, jobs.len() as i64)?;
        }
        Ok(Ok(()))
    }

    /// Schedules the failed jobs of an upgrade again as a new upgrade and
    /// activates it right away on behalf of `username`.
    ///
    /// The activation policy does not apply: the requester retries a change
    /// someone else already approved. Returns `None` when nothing failed.
    pub async fn retry_failed_upgrade(
        &self,
        upgrade_id: i64,
        username: &str,
        reporter: &dyn JobReporter,
    ) -> Result<Option<UpgradeView>> {
        self.get_upgrade(upgrade_id)?;

        let failed = self.list_jobs(
            &JobFilter::by_upgrade(upgrade_id).with_statuses(&[PushStatus::Failed]),
            JobSort::default(),
            SortDir::Asc,
        )?;
        if failed.is_empty() {
            tracing::info!(upgrade_id, "no failed jobs to retry");
            return Ok(None);
        }

        let rows: Vec<OrgVersionRow> = failed
            .iter()
            .map(|job| OrgVersionRow {
                package_org_id: job.package_org_id.clone(),
                version_id: job.version_id.clone(),
                org_id: job.org_id.clone(),
            })
            .collect();
        let request = ScheduleRequest {
            start_time: None,
            created_by: Some(username.to_string()),
            description: Some(format!("Retry of upgrade {}", upgrade_id)),
            blacklist: Vec::new(),
            targets: group_targets(&rows),
        };

        let scheduled = self.schedule_upgrade(&request).await?;
        if scheduled.upgrade.status != UpgradeStatus::Ready {
            return Ok(Some(scheduled));
        }
        let activated = self
            .activate_unchecked(scheduled.upgrade.id, username, reporter)
            .await?;
        tracing::info!(
            upgrade_id,
            retry_upgrade_id = activated.upgrade.id,
            jobs = failed.len(),
            "retrying failed upgrade"
        );
        Ok(Some(activated))
    }

    /// Cancels every push request still `Created` in the given package
    /// orgs. Returns how many were canceled.
    pub async fn clear_requests(&self, package_org_ids: &[String]) -> Result<usize> {
        let cache = self.connections();
        let canceled = push::clear_requests(&cache, package_org_ids).await?;
        tracing::info!(canceled, "cleared created push requests");
        Ok(canceled)
    }
}
