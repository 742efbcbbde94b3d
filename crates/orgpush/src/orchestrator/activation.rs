//! Upgrade and item activation.

use tracing::Instrument;

use super::bucket::{activatable, partition};
use super::reporter::JobReporter;
use super::{check_activation_policy, Orchestrator};
use crate::db::item_repo::{self, ItemFilter, ItemView};
use crate::db::query::ItemSort;
use crate::db::upgrade_repo;
use crate::db::SortDir;
use crate::error::{OrgPushError, Result, ValidationError};
use crate::gateway::push::{self, RequestRef};
use crate::logging::upgrade_span;
use crate::status::{PushStatus, UpgradeStatus};

impl Orchestrator {
    /// Activates a `Ready` upgrade on behalf of `username`.
    ///
    /// Starts the first dependency bucket, then moves the upgrade to
    /// `Active`. Later buckets are started by the monitor.
    pub async fn activate_upgrade(
        &self,
        upgrade_id: i64,
        username: &str,
        reporter: &dyn JobReporter,
    ) -> Result<upgrade_repo::UpgradeView> {
        let upgrade = upgrade_repo::find_by_id(&self.db, upgrade_id)?
            .ok_or_else(|| OrgPushError::not_found("upgrade", upgrade_id))?;

        if upgrade.status != UpgradeStatus::Ready {
            return Err(ValidationError::InvalidState {
                id: upgrade_id,
                action: "activate",
                status: upgrade.status,
            }
            .into());
        }
        if self.enforce_activation_policy {
            check_activation_policy(upgrade_id, upgrade.created_by.as_deref(), username)?;
        }

        self.activate_unchecked(upgrade_id, username, reporter)
            .await
    }

    /// Activation without the policy check.
    pub(crate) async fn activate_unchecked(
        &self,
        upgrade_id: i64,
        username: &str,
        reporter: &dyn JobReporter,
    ) -> Result<upgrade_repo::UpgradeView> {
        async {
            let items = self.activate_available_items(upgrade_id, reporter).await?;
            self.transition_upgrade(upgrade_id, UpgradeStatus::Active)?;
            tracing::info!(
                username,
                eligible_items = items.len(),
                "activated upgrade"
            );
            self.get_upgrade(upgrade_id)
        }
        .instrument(upgrade_span("activate", upgrade_id))
        .await
    }

    /// Runs one bucket activation pass over an upgrade's items.
    ///
    /// Items without eligible jobs are marked `Ineligible` and left out. Of
    /// the rest, every `Created` item whose bucket is open gets its push
    /// request moved to `Pending`. Running the pass again without remote
    /// progress changes nothing. Returns the eligible items as loaded.
    pub async fn activate_available_items(
        &self,
        upgrade_id: i64,
        reporter: &dyn JobReporter,
    ) -> Result<Vec<ItemView>> {
        let items = item_repo::list(
            &self.db,
            &ItemFilter::Upgrade(upgrade_id),
            ItemSort::Activation,
            SortDir::Asc,
        )?;

        let mut eligible = Vec::with_capacity(items.len());
        for item in items {
            if item.counts.eligible_job_count == 0 {
                self.mark_ineligible(&item);
            } else {
                eligible.push(item);
            }
        }

        let buckets = partition(&eligible);
        let ready = activatable(&buckets);
        if ready.is_empty() {
            return Ok(eligible);
        }

        let cache = self.connections();
        let requests: Vec<RequestRef> = ready.iter().map(|item| RequestRef::from(*item)).collect();
        let ids: Vec<i64> = ready.iter().map(|item| item.id).collect();
        if let Err(e) = push::update_push_requests(&cache, &requests, PushStatus::Pending).await {
            // Requests updated before the rejection are Pending remotely while
            // their items stay Created here until activation is retried.
            tracing::error!(
                upgrade_id,
                item_ids = ?ids,
                error = %e,
                "push request activation rejected; local items left Created"
            );
            return Err(e.into());
        }

        self.change_items_and_jobs_status(upgrade_id, &ids, PushStatus::Pending)?;

        for item in &ready {
            reporter.report(&format!("Activated item {} for {}", item.id, item.label()));
        }

        Ok(eligible)
    }

    /// Activates a single `Created` item regardless of its bucket.
    ///
    /// Returns `None` when the item has no eligible jobs; it is marked
    /// `Ineligible` instead.
    pub async fn activate_item(
        &self,
        item_id: i64,
        reporter: &dyn JobReporter,
    ) -> Result<Option<ItemView>> {
        let item = self.get_item(item_id)?;

        if item.counts.eligible_job_count == 0 {
            self.mark_ineligible(&item);
            return Ok(None);
        }
        if item.status != PushStatus::Created {
            return Err(ValidationError::InvalidItemState {
                id: item_id,
                action: "activate",
                status: item.status,
            }
            .into());
        }

        let cache = self.connections();
        push::update_push_requests(&cache, &[RequestRef::from(&item)], PushStatus::Pending)
            .await?;
        self.change_items_and_jobs_status(item.upgrade_id, &[item.id], PushStatus::Pending)?;
        reporter.report(&format!("Activated item {} for {}", item.id, item.label()));

        Ok(Some(self.get_item(item_id)?))
    }
}
