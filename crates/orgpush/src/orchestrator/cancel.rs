//! Cancellation of upgrades, items and jobs.

use tracing::Instrument;

use super::Orchestrator;
use crate::broadcast::{ItemChange, JobChange, UpgradeEvent};
use crate::db::item_repo::{self, ItemFilter, ItemView};
use crate::db::job_repo::{self, JobView};
use crate::db::query::ItemSort;
use crate::db::upgrade_repo::{self, UpgradeView};
use crate::db::SortDir;
use crate::error::{OrgPushError, Result, ValidationError};
use crate::gateway::push::{self, RequestRef};
use crate::logging::upgrade_span;
use crate::status::{PushStatus, UpgradeStatus};

impl Orchestrator {
    /// Cancels an upgrade that has not finished yet, with all of its active
    /// items and their jobs.
    pub async fn cancel_upgrade(&self, upgrade_id: i64) -> Result<UpgradeView> {
        let upgrade = upgrade_repo::find_by_id(&self.db, upgrade_id)?
            .ok_or_else(|| OrgPushError::not_found("upgrade", upgrade_id))?;
        if upgrade.status.is_terminal() {
            return Err(ValidationError::InvalidState {
                id: upgrade_id,
                action: "cancel",
                status: upgrade.status,
            }
            .into());
        }

        async {
            let items = item_repo::list(
                &self.db,
                &ItemFilter::Upgrade(upgrade_id),
                ItemSort::Id,
                SortDir::Asc,
            )?;
            let active: Vec<&ItemView> = items.iter().filter(|i| i.status.is_active()).collect();
            self.cancel_items(upgrade_id, &active).await?;
            self.transition_upgrade(upgrade_id, UpgradeStatus::Canceled)?;
            tracing::info!(items = active.len(), "canceled upgrade");
            self.get_upgrade(upgrade_id)
        }
        .instrument(upgrade_span("cancel", upgrade_id))
        .await
    }

    /// Cancels one active item and its jobs.
    pub async fn cancel_item(&self, item_id: i64) -> Result<ItemView> {
        let item = self.get_item(item_id)?;
        if !item.status.is_active() {
            return Err(ValidationError::InvalidItemState {
                id: item_id,
                action: "cancel",
                status: item.status,
            }
            .into());
        }
        self.cancel_items(item.upgrade_id, &[&item]).await?;
        tracing::info!(item_id, upgrade_id = item.upgrade_id, "canceled upgrade item");
        self.get_item(item_id)
    }

    /// Cancels one active job.
    pub async fn cancel_job(&self, id: i64) -> Result<JobView> {
        let job = self.get_job(id)?;
        if !job.status.is_active() {
            return Err(ValidationError::InvalidJobState {
                id,
                action: "cancel",
                status: job.status,
            }
            .into());
        }

        if let Some(job_id) = &job.job_id {
            let cache = self.connections();
            push::update_push_jobs(
                &cache,
                &job.package_org_id,
                std::slice::from_ref(job_id),
                PushStatus::Canceled,
            )
            .await?;
        }
        job_repo::update_status(&self.db, id, PushStatus::Canceled)?;
        tracing::info!(job_id = id, org_id = %job.org_id, "canceled upgrade job");

        self.events.send(UpgradeEvent::UpgradeJobs(vec![JobChange {
            id,
            item_id: job.item_id,
            org_id: job.org_id.clone(),
            status: PushStatus::Canceled,
            message: job.message.clone(),
        }]));
        self.events.send(UpgradeEvent::UpgradeItems(vec![ItemChange {
            id: job.item_id,
            status: None,
        }]));

        self.get_job(id)
    }

    /// Cancels the push requests of `items` remotely, then locally.
    async fn cancel_items(&self, upgrade_id: i64, items: &[&ItemView]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let cache = self.connections();
        let requests: Vec<RequestRef> = items.iter().map(|item| RequestRef::from(*item)).collect();
        push::update_push_requests(&cache, &requests, PushStatus::Canceled).await?;

        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        self.change_items_and_jobs_status(upgrade_id, &ids, PushStatus::Canceled)
    }
}
