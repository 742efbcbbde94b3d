//! Upgrade event bus for streaming state changes to listeners.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::upgrade_repo::{BlacklistRow, UpgradeView};
use crate::status::PushStatus;

/// Item change notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemChange {
    pub id: i64,
    /// `None` when only counters changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PushStatus>,
}

/// Job change notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobChange {
    pub id: i64,
    pub item_id: i64,
    pub org_id: String,
    pub status: PushStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// State change published by the orchestrator.
///
/// The `event` tag values are the external event names and must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum UpgradeEvent {
    #[serde(rename = "upgrade")]
    Upgrade(UpgradeView),
    #[serde(rename = "upgrade-items")]
    UpgradeItems(Vec<ItemChange>),
    #[serde(rename = "upgrade-jobs")]
    UpgradeJobs(Vec<JobChange>),
    #[serde(rename = "upgrade-blacklist")]
    UpgradeBlacklist(Vec<BlacklistRow>),
    /// Upgrades were removed as a set.
    #[serde(rename = "upgrades")]
    Upgrades { purged: Vec<i64> },
    /// Failure that no caller will see otherwise.
    #[serde(rename = "notify")]
    Notify { subject: String, message: String },
}

impl UpgradeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UpgradeEvent::Upgrade(_) => "upgrade",
            UpgradeEvent::UpgradeItems(_) => "upgrade-items",
            UpgradeEvent::UpgradeJobs(_) => "upgrade-jobs",
            UpgradeEvent::UpgradeBlacklist(_) => "upgrade-blacklist",
            UpgradeEvent::Upgrades { .. } => "upgrades",
            UpgradeEvent::Notify { .. } => "notify",
        }
    }

    pub fn notify(subject: impl Into<String>, message: impl Into<String>) -> Self {
        UpgradeEvent::Notify {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Fire-and-forget publisher of upgrade events.
#[derive(Clone)]
pub struct UpgradeEventBus {
    sender: Arc<broadcast::Sender<UpgradeEvent>>,
}

impl UpgradeEventBus {
    /// Creates a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn send(&self, event: UpgradeEvent) {
        tracing::trace!(event = event.name(), "publishing upgrade event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpgradeEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UpgradeEventBus {
    fn default() -> Self {
        Self::new(crate::config::schema::DEFAULT_EVENT_CAPACITY)
    }
}
