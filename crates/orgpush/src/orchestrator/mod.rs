//! Upgrade orchestration: creation, activation, reconciliation, cancellation
//! and dispatch.
//!
//! The [`Orchestrator`] owns no in-memory state between calls. Every
//! workflow reloads what it needs from the store, talks to package orgs
//! through a per-call [`ConnectionCache`], and publishes what changed on the
//! event bus.

pub mod activation;
pub mod bucket;
pub mod cancel;
pub mod dispatch;
pub mod reconcile;
pub mod reporter;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::{ItemChange, JobChange, UpgradeEvent, UpgradeEventBus};
use crate::config::EngineConfig;
use crate::db::item_repo::{self, ItemFilter, ItemView, NewItem};
use crate::db::job_repo::{self, JobFilter, JobView, NewJob};
use crate::db::query::{ItemSort, JobSort, UpgradeSort};
use crate::db::upgrade_repo::{self, Transition, UpgradeRow, UpgradeView};
use crate::db::{catalog_repo, Database, SortDir};
use crate::error::{OrgPushError, Result, ValidationError};
use crate::gateway::{ConnectionCache, Connector};
use crate::status::{PushStatus, UpgradeStatus};

pub use dispatch::{group_targets, OrgVersionRow, PushTarget, ScheduleRequest};
pub use reconcile::{ItemStatusCounts, JobStatusCounts};
pub use reporter::{CollectingReporter, JobReporter, LogReporter};

/// Structured entry stored in a job's message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub title: String,
    pub details: String,
    pub message: String,
}

impl JobErrorEntry {
    pub fn new(title: &str, details: &str, message: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            details: details.to_string(),
            message: message.into(),
        }
    }
}

/// Serializes error entries into the job message format.
pub fn encode_job_errors(entries: &[JobErrorEntry]) -> String {
    serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string())
}

/// Records the installed version of orgs whose jobs succeeded.
pub trait InstallRecorder: Send + Sync {
    fn record_succeeded_installs(&self, jobs: &[JobView]) -> Result<()>;
}

/// Writes succeeded installs to the org package version read model.
pub struct OrgPackageVersionRecorder {
    db: Database,
}

impl OrgPackageVersionRecorder {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl InstallRecorder for OrgPackageVersionRecorder {
    fn record_succeeded_installs(&self, jobs: &[JobView]) -> Result<()> {
        let now = Utc::now();
        for job in jobs {
            match job.package_id.as_deref() {
                Some(package_id) => catalog_repo::upsert_installed_version(
                    &self.db,
                    &job.org_id,
                    package_id,
                    &job.version_id,
                    now,
                )?,
                None => log::warn!(
                    "No package known for version {}; install of org {} not recorded",
                    job.version_id,
                    job.org_id
                ),
            }
        }
        Ok(())
    }
}

/// Checks whether `username` may activate an upgrade created by
/// `created_by`.
pub fn check_activation_policy(
    upgrade_id: i64,
    created_by: Option<&str>,
    username: &str,
) -> std::result::Result<(), ValidationError> {
    match created_by {
        None => Err(ValidationError::PolicyViolation {
            id: upgrade_id,
            reason: "cannot activate without knowing who created it".to_string(),
        }),
        Some(creator) if creator == username => Err(ValidationError::PolicyViolation {
            id: upgrade_id,
            reason: format!("cannot be activated by {} who created it", username),
        }),
        Some(_) => Ok(()),
    }
}

/// The upgrade state machine.
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    connector: Arc<dyn Connector>,
    events: UpgradeEventBus,
    installs: Arc<dyn InstallRecorder>,
    enforce_activation_policy: bool,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        connector: Arc<dyn Connector>,
        events: UpgradeEventBus,
        config: &EngineConfig,
    ) -> Self {
        Self {
            installs: Arc::new(OrgPackageVersionRecorder::new(db.clone())),
            db,
            connector,
            events,
            enforce_activation_policy: config.enforce_activation_policy,
        }
    }

    /// Replaces the install recorder.
    pub fn with_install_recorder(mut self, installs: Arc<dyn InstallRecorder>) -> Self {
        self.installs = installs;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &UpgradeEventBus {
        &self.events
    }

    pub fn enforces_activation_policy(&self) -> bool {
        self.enforce_activation_policy
    }

    /// Fresh connection memo for one workflow invocation.
    pub(crate) fn connections(&self) -> ConnectionCache {
        ConnectionCache::new(Arc::clone(&self.connector))
    }

    // ---- creation ----

    /// Creates an upgrade in status `Ready`.
    ///
    /// The blacklist is stored in the background. A failure there is logged
    /// and announced with a `notify` event but does not fail the upgrade.
    pub async fn create_upgrade(
        &self,
        start_time: Option<DateTime<Utc>>,
        created_by: Option<&str>,
        description: Option<&str>,
        blacklist: &[String],
    ) -> Result<UpgradeRow> {
        let upgrade = upgrade_repo::insert(&self.db, start_time, created_by, description)?;
        tracing::info!(upgrade_id = upgrade.id, "created upgrade");

        if !blacklist.is_empty() {
            let db = self.db.clone();
            let events = self.events.clone();
            let org_ids = blacklist.to_vec();
            let upgrade_id = upgrade.id;
            tokio::task::spawn_blocking(move || {
                match upgrade_repo::insert_blacklist(&db, upgrade_id, &org_ids) {
                    Ok(rows) => events.send(UpgradeEvent::UpgradeBlacklist(rows)),
                    Err(e) => {
                        tracing::error!(upgrade_id, error = %e, "failed to store upgrade blacklist");
                        events.send(UpgradeEvent::notify(
                            format!("Failed to store blacklist of upgrade {}", upgrade_id),
                            e.to_string(),
                        ));
                    }
                }
            });
        }

        Ok(upgrade)
    }

    /// Stores the item of a push request created remotely.
    #[allow(clippy::too_many_arguments)]
    pub fn create_upgrade_item(
        &self,
        upgrade_id: i64,
        push_request_id: &str,
        package_org_id: &str,
        version_id: &str,
        start_time: Option<DateTime<Utc>>,
        status: PushStatus,
        created_by: Option<&str>,
        total_job_count: i64,
    ) -> Result<i64> {
        let id = item_repo::insert(
            &self.db,
            &NewItem {
                upgrade_id,
                push_request_id: push_request_id.to_string(),
                package_org_id: package_org_id.to_string(),
                version_id: version_id.to_string(),
                start_time,
                status,
                created_by: created_by.map(str::to_string),
                total_job_count,
            },
        )?;
        self.events.send(UpgradeEvent::UpgradeItems(vec![ItemChange {
            id,
            status: Some(status),
        }]));
        Ok(id)
    }

    /// Stores the jobs of a push request as one batch.
    pub fn create_upgrade_jobs(
        &self,
        upgrade_id: i64,
        item_id: i64,
        push_request_id: &str,
        jobs: &[NewJob],
    ) -> Result<Vec<i64>> {
        let ids = job_repo::insert_batch(&self.db, upgrade_id, item_id, push_request_id, jobs)?;
        let changes = ids
            .iter()
            .zip(jobs)
            .map(|(id, job)| JobChange {
                id: *id,
                item_id,
                org_id: job.org_id.clone(),
                status: job.status,
                message: job.message.clone(),
            })
            .collect();
        self.events.send(UpgradeEvent::UpgradeJobs(changes));
        self.events.send(UpgradeEvent::UpgradeItems(vec![ItemChange {
            id: item_id,
            status: None,
        }]));
        Ok(ids)
    }

    /// Corrects the expected job count of an item.
    pub fn change_item_total_job_count(&self, item_id: i64, count: i64) -> Result<()> {
        item_repo::update_total_job_count(&self.db, item_id, count)?;
        self.events.send(UpgradeEvent::UpgradeItems(vec![ItemChange {
            id: item_id,
            status: None,
        }]));
        Ok(())
    }

    // ---- status changes shared by the workflows ----

    pub(crate) fn change_item_status(&self, item: &ItemView, status: PushStatus) -> Result<()> {
        item_repo::update_status(&self.db, item.id, status)?;
        self.announce_items(item.upgrade_id, &[item.id], Some(status));
        Ok(())
    }

    /// Sets items and their message-free jobs to `status`.
    pub(crate) fn change_items_and_jobs_status(
        &self,
        upgrade_id: i64,
        item_ids: &[i64],
        status: PushStatus,
    ) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        item_repo::update_status_with_jobs(&self.db, item_ids, status)?;
        self.announce_items(upgrade_id, item_ids, Some(status));
        Ok(())
    }

    /// Marks an item without eligible jobs `Ineligible`, once.
    pub(crate) fn mark_ineligible(&self, item: &ItemView) {
        if item.status == PushStatus::Ineligible {
            return;
        }
        match self.change_item_status(item, PushStatus::Ineligible) {
            Ok(()) => tracing::warn!(
                item_id = item.id,
                push_request_id = %item.push_request_id,
                "cannot activate an upgrade item with no eligible jobs"
            ),
            Err(e) => tracing::error!(
                item_id = item.id,
                push_request_id = %item.push_request_id,
                error = %e,
                "failed to mark item as ineligible"
            ),
        }
    }

    fn announce_items(&self, upgrade_id: i64, item_ids: &[i64], status: Option<PushStatus>) {
        self.announce_upgrade(upgrade_id);
        self.events.send(UpgradeEvent::UpgradeItems(
            item_ids
                .iter()
                .map(|id| ItemChange { id: *id, status })
                .collect(),
        ));
    }

    pub(crate) fn announce_upgrade(&self, upgrade_id: i64) {
        match upgrade_repo::find_view_by_id(&self.db, upgrade_id) {
            Ok(Some(view)) => self.events.send(UpgradeEvent::Upgrade(view)),
            Ok(None) => {}
            Err(e) => tracing::warn!(upgrade_id, error = %e, "cannot load upgrade for event"),
        }
    }

    /// Applies a guarded upgrade transition and publishes the new state.
    pub(crate) fn transition_upgrade(&self, upgrade_id: i64, next: UpgradeStatus) -> Result<()> {
        match upgrade_repo::transition_status(&self.db, upgrade_id, next)? {
            Transition::Applied => {
                tracing::info!(upgrade_id, status = %next, "upgrade status changed");
                self.announce_upgrade(upgrade_id);
                Ok(())
            }
            Transition::Rejected { current } => Err(ValidationError::InvalidTransition {
                id: upgrade_id,
                from: current,
                to: next,
            }
            .into()),
            Transition::NotFound => Err(OrgPushError::not_found("upgrade", upgrade_id)),
        }
    }

    /// Marks an upgrade `Failed` and raises a failure notification.
    pub fn fail_upgrade(&self, upgrade_id: i64, reason: &str) -> Result<()> {
        tracing::error!(upgrade_id, reason, "failed to schedule upgrade");
        self.transition_upgrade(upgrade_id, UpgradeStatus::Failed)?;
        self.events.send(UpgradeEvent::notify(
            format!("Upgrade {} failed", upgrade_id),
            reason,
        ));
        Ok(())
    }

    // ---- queries ----

    pub fn get_upgrade(&self, id: i64) -> Result<UpgradeView> {
        upgrade_repo::find_view_by_id(&self.db, id)?
            .ok_or_else(|| OrgPushError::not_found("upgrade", id))
    }

    pub fn list_upgrades(&self, sort: UpgradeSort, dir: SortDir) -> Result<Vec<UpgradeView>> {
        Ok(upgrade_repo::list(&self.db, sort, dir)?)
    }

    pub fn get_blacklist(&self, upgrade_id: i64) -> Result<Vec<String>> {
        Ok(upgrade_repo::find_blacklist(&self.db, upgrade_id)?)
    }

    pub fn get_item(&self, id: i64) -> Result<ItemView> {
        item_repo::find_view_by_id(&self.db, id)?
            .ok_or_else(|| OrgPushError::not_found("upgrade item", id))
    }

    pub fn list_items(
        &self,
        filter: &ItemFilter,
        sort: ItemSort,
        dir: SortDir,
    ) -> Result<Vec<ItemView>> {
        Ok(item_repo::list(&self.db, filter, sort, dir)?)
    }

    pub fn get_job(&self, id: i64) -> Result<JobView> {
        job_repo::find_view_by_id(&self.db, id)?
            .ok_or_else(|| OrgPushError::not_found("upgrade job", id))
    }

    pub fn list_jobs(&self, filter: &JobFilter, sort: JobSort, dir: SortDir) -> Result<Vec<JobView>> {
        Ok(job_repo::list(&self.db, filter, sort, dir)?)
    }

    /// Active upgrades whose start time has passed.
    pub fn active_upgrades(&self, now: DateTime<Utc>) -> Result<Vec<UpgradeRow>> {
        Ok(upgrade_repo::find_active_started(&self.db, now)?)
    }

    pub fn any_unfinished(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(upgrade_repo::any_unfinished(&self.db, now)?)
    }

    /// Moves an Active upgrade to `Done` once none of its jobs is still
    /// active. Returns true when the transition happened.
    pub fn complete_if_finished(&self, upgrade_id: i64) -> Result<bool> {
        if !upgrade_repo::are_jobs_complete(&self.db, upgrade_id)? {
            return Ok(false);
        }
        self.transition_upgrade(upgrade_id, UpgradeStatus::Done)?;
        Ok(true)
    }

    /// Hard-deletes upgrades with everything they own.
    pub fn purge(&self, upgrade_ids: &[i64]) -> Result<usize> {
        let removed = upgrade_repo::purge(&self.db, upgrade_ids)?;
        tracing::info!(removed, "purged upgrades");
        self.events.send(UpgradeEvent::Upgrades {
            purged: upgrade_ids.to_vec(),
        });
        Ok(removed)
    }
}
