//! Status vocabularies shared by the store, the gateway and the orchestrator.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Lifecycle of an upgrade campaign.
///
/// Transitions only move forward: `Ready -> Active -> Done`, and either
/// `Ready` or `Active` may end in `Canceled` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeStatus {
    Ready,
    Active,
    Done,
    Canceled,
    Failed,
}

impl UpgradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeStatus::Ready => "Ready",
            UpgradeStatus::Active => "Active",
            UpgradeStatus::Done => "Done",
            UpgradeStatus::Canceled => "Canceled",
            UpgradeStatus::Failed => "Failed",
        }
    }

    /// Returns true once no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeStatus::Done | UpgradeStatus::Canceled | UpgradeStatus::Failed
        )
    }

    /// Statuses an upgrade may be in immediately before moving to `self`.
    pub fn allowed_predecessors(&self) -> &'static [UpgradeStatus] {
        match self {
            UpgradeStatus::Ready => &[],
            UpgradeStatus::Active => &[UpgradeStatus::Ready],
            UpgradeStatus::Done => &[UpgradeStatus::Active],
            UpgradeStatus::Canceled | UpgradeStatus::Failed => {
                &[UpgradeStatus::Ready, UpgradeStatus::Active]
            }
        }
    }

    pub fn can_transition_to(&self, next: UpgradeStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

/// Status of a push request (item) or push job.
///
/// The first six values mirror the remote push API. `Ineligible` and
/// `Invalid` are assigned locally and never sent to a remote org.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushStatus {
    Created,
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
    Ineligible,
    Invalid,
}

impl PushStatus {
    /// Statuses that still expect remote progress.
    pub const ACTIVE: [PushStatus; 3] = [
        PushStatus::Created,
        PushStatus::Pending,
        PushStatus::InProgress,
    ];

    /// Statuses the monitor pulls remote state for.
    pub const RUNNING: [PushStatus; 2] = [PushStatus::Pending, PushStatus::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Created => "Created",
            PushStatus::Pending => "Pending",
            PushStatus::InProgress => "InProgress",
            PushStatus::Succeeded => "Succeeded",
            PushStatus::Failed => "Failed",
            PushStatus::Canceled => "Canceled",
            PushStatus::Ineligible => "Ineligible",
            PushStatus::Invalid => "Invalid",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Ineligible and Invalid count as terminal alongside the remote
    /// end states.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether this value may cross the gateway boundary.
    pub fn is_remote(&self) -> bool {
        !matches!(self, PushStatus::Ineligible | PushStatus::Invalid)
    }
}

/// Error returned when a status string is not part of a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status '{value}'")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for UpgradeStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ready" => Ok(UpgradeStatus::Ready),
            "Active" => Ok(UpgradeStatus::Active),
            "Done" => Ok(UpgradeStatus::Done),
            "Canceled" => Ok(UpgradeStatus::Canceled),
            "Failed" => Ok(UpgradeStatus::Failed),
            other => Err(UnknownStatus {
                kind: "upgrade",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for PushStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(PushStatus::Created),
            "Pending" => Ok(PushStatus::Pending),
            "InProgress" => Ok(PushStatus::InProgress),
            "Succeeded" => Ok(PushStatus::Succeeded),
            "Failed" => Ok(PushStatus::Failed),
            "Canceled" => Ok(PushStatus::Canceled),
            "Ineligible" => Ok(PushStatus::Ineligible),
            "Invalid" => Ok(PushStatus::Invalid),
            other => Err(UnknownStatus {
                kind: "push",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for UpgradeStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for UpgradeStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: UnknownStatus| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for PushStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PushStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: UnknownStatus| FromSqlError::Other(Box::new(e)))
    }
}
