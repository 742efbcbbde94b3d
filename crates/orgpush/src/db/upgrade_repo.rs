//! Upgrade repository: the `upgrade` and `upgrade_blacklist` tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::query::{format_timestamp, order_by, timestamp_column, SortDir, UpgradeSort};
use super::{placeholders, Database, DatabaseError};
use crate::status::{PushStatus, UpgradeStatus};

/// A raw upgrade row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRow {
    pub id: i64,
    pub status: UpgradeStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub description: Option<String>,
}

impl UpgradeRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            start_time: timestamp_column(row, "start_time")?,
            created_by: row.get("created_by")?,
            description: row.get("description")?,
        })
    }
}

/// Progress of an upgrade derived from the statuses of its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeProgress {
    Invalid,
    Scheduled,
    Canceled,
    Active,
    CompleteWithFailures,
    Complete,
}

/// Derives the aggregate progress of an upgrade. First matching rule wins.
pub fn derive_progress(item_statuses: &[PushStatus]) -> UpgradeProgress {
    let any = |pred: fn(&PushStatus) -> bool| item_statuses.iter().any(pred);

    if item_statuses.is_empty() {
        UpgradeProgress::Invalid
    } else if item_statuses.iter().all(|s| *s == PushStatus::Created) {
        UpgradeProgress::Scheduled
    } else if any(|s| *s == PushStatus::Canceled) {
        UpgradeProgress::Canceled
    } else if any(|s| s.is_active()) {
        UpgradeProgress::Active
    } else if any(|s| matches!(s, PushStatus::Failed | PushStatus::Ineligible)) {
        UpgradeProgress::CompleteWithFailures
    } else {
        UpgradeProgress::Complete
    }
}

/// An upgrade together with its derived progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeView {
    #[serde(flatten)]
    pub upgrade: UpgradeRow,
    pub progress: UpgradeProgress,
}

/// One excluded org of an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistRow {
    pub upgrade_id: i64,
    pub org_id: String,
}

/// Outcome of a guarded status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Rejected { current: UpgradeStatus },
    NotFound,
}

const SELECT_UPGRADE: &str =
    "SELECT u.id, u.status, u.start_time, u.created_by, u.description FROM upgrade u";

/// Inserts a new upgrade in status `Ready`.
pub fn insert(
    db: &Database,
    start_time: Option<DateTime<Utc>>,
    created_by: Option<&str>,
    description: Option<&str>,
) -> Result<UpgradeRow, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO upgrade (start_time, created_by, description, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                start_time.map(format_timestamp),
                created_by,
                description,
                UpgradeStatus::Ready
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(UpgradeRow {
            id,
            status: UpgradeStatus::Ready,
            start_time,
            created_by: created_by.map(str::to_string),
            description: description.map(str::to_string),
        })
    })
}

/// Finds an upgrade by id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<UpgradeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                &format!("{} WHERE u.id = ?1", SELECT_UPGRADE),
                params![id],
                UpgradeRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds an upgrade with its derived progress.
pub fn find_view_by_id(db: &Database, id: i64) -> Result<Option<UpgradeView>, DatabaseError> {
    match find_by_id(db, id)? {
        Some(upgrade) => Ok(Some(with_progress(db, vec![upgrade])?.remove(0))),
        None => Ok(None),
    }
}

/// Lists all upgrades with their derived progress.
pub fn list(
    db: &Database,
    sort: UpgradeSort,
    dir: SortDir,
) -> Result<Vec<UpgradeView>, DatabaseError> {
    let upgrades = db.with_conn(|conn| {
        let sql = format!("{} {}", SELECT_UPGRADE, order_by(sort.columns(), dir));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], UpgradeRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;
    with_progress(db, upgrades)
}

fn with_progress(
    db: &Database,
    upgrades: Vec<UpgradeRow>,
) -> Result<Vec<UpgradeView>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT status FROM upgrade_item WHERE upgrade_id = ?1")?;
        upgrades
            .into_iter()
            .map(|upgrade| -> Result<UpgradeView, DatabaseError> {
                let statuses = stmt
                    .query_map(params![upgrade.id], |r| r.get::<_, PushStatus>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(UpgradeView {
                    progress: derive_progress(&statuses),
                    upgrade,
                })
            })
            .collect()
    })
}

/// Active upgrades whose start time has passed. A missing start time
/// counts as already started.
pub fn find_active_started(
    db: &Database,
    now: DateTime<Utc>,
) -> Result<Vec<UpgradeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "{} WHERE u.status = ?1 AND COALESCE(u.start_time, '') <= ?2 ORDER BY u.id",
            SELECT_UPGRADE
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![UpgradeStatus::Active, format_timestamp(now)],
                UpgradeRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves an upgrade to `next` only if its current status is an allowed
/// predecessor. The check and the write are one statement.
pub fn transition_status(
    db: &Database,
    id: i64,
    next: UpgradeStatus,
) -> Result<Transition, DatabaseError> {
    let from = next.allowed_predecessors();
    db.with_conn(|conn| {
        let changed = if from.is_empty() {
            0
        } else {
            let sql = format!(
                "UPDATE upgrade SET status = ?1 WHERE id = ?2 AND status IN ({})",
                placeholders(3, from.len())
            );
            let mut param_values: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
            param_values.push(&next);
            param_values.push(&id);
            for status in from {
                param_values.push(status);
            }
            conn.execute(&sql, param_values.as_slice())?
        };

        if changed > 0 {
            return Ok(Transition::Applied);
        }

        let current: Option<UpgradeStatus> = conn
            .query_row(
                "SELECT status FROM upgrade WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match current {
            Some(current) => Transition::Rejected { current },
            None => Transition::NotFound,
        })
    })
}

/// Inserts the excluded orgs of an upgrade. Duplicates are ignored.
pub fn insert_blacklist(
    db: &Database,
    upgrade_id: i64,
    org_ids: &[String],
) -> Result<Vec<BlacklistRow>, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut rows = Vec::with_capacity(org_ids.len());
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO upgrade_blacklist (upgrade_id, org_id) VALUES (?1, ?2)",
            )?;
            for org_id in org_ids {
                if stmt.execute(params![upgrade_id, org_id])? > 0 {
                    rows.push(BlacklistRow {
                        upgrade_id,
                        org_id: org_id.clone(),
                    });
                }
            }
        }
        tx.commit()?;
        Ok(rows)
    })
}

/// Returns the excluded org ids of an upgrade.
pub fn find_blacklist(db: &Database, upgrade_id: i64) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT org_id FROM upgrade_blacklist WHERE upgrade_id = ?1 ORDER BY org_id",
        )?;
        let rows = stmt
            .query_map(params![upgrade_id], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    })
}

/// Cheap gate for the monitor: is any upgrade active, or any item or job
/// still active, with its start time passed?
pub fn any_unfinished(db: &Database, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found = conn
            .query_row(
                "SELECT j.id FROM upgrade_job j
                 INNER JOIN upgrade u ON u.id = j.upgrade_id
                 INNER JOIN upgrade_item i ON i.id = j.item_id
                 WHERE COALESCE(u.start_time, '') <= ?1 AND (u.status = ?2
                    OR i.status IN (?3, ?4, ?5) OR j.status IN (?3, ?4, ?5))
                 LIMIT 1",
                params![
                    format_timestamp(now),
                    UpgradeStatus::Active,
                    PushStatus::Created,
                    PushStatus::Pending,
                    PushStatus::InProgress
                ],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(true);
        }
        // An active upgrade without any job still needs a pass to be closed.
        let bare = conn
            .query_row(
                "SELECT u.id FROM upgrade u
                 WHERE u.status = ?1 AND COALESCE(u.start_time, '') <= ?2 LIMIT 1",
                params![UpgradeStatus::Active, format_timestamp(now)],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        Ok(bare.is_some())
    })
}

/// True when no job of the upgrade is still Created, Pending or InProgress.
pub fn are_jobs_complete(db: &Database, upgrade_id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let open = conn
            .query_row(
                "SELECT id FROM upgrade_job WHERE upgrade_id = ?1
                 AND status IN (?2, ?3, ?4) LIMIT 1",
                params![
                    upgrade_id,
                    PushStatus::Created,
                    PushStatus::Pending,
                    PushStatus::InProgress
                ],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        Ok(open.is_none())
    })
}

/// Hard-deletes upgrades with their jobs, items and blacklist rows.
/// Returns the number of upgrades removed.
pub fn purge(db: &Database, ids: &[i64]) -> Result<usize, DatabaseError> {
    if ids.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let list = placeholders(1, ids.len());
        tx.execute(
            &format!("DELETE FROM upgrade_job WHERE upgrade_id IN ({})", list),
            params_from_iter(ids),
        )?;
        tx.execute(
            &format!("DELETE FROM upgrade_item WHERE upgrade_id IN ({})", list),
            params_from_iter(ids),
        )?;
        tx.execute(
            &format!("DELETE FROM upgrade_blacklist WHERE upgrade_id IN ({})", list),
            params_from_iter(ids),
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM upgrade WHERE id IN ({})", list),
            params_from_iter(ids),
        )?;
        tx.commit()?;
        Ok(removed)
    })
}
