//! Upgrade item repository: one push request per package version.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::query::{format_timestamp, order_by, timestamp_column, ItemSort, SortDir};
use super::{placeholders, Database, DatabaseError};
use crate::status::PushStatus;

/// Values for a new item row.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub upgrade_id: i64,
    pub push_request_id: String,
    pub package_org_id: String,
    pub version_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub status: PushStatus,
    pub created_by: Option<String>,
    pub total_job_count: i64,
}

/// Job tallies of an item, by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub job_count: i64,
    /// Jobs whose status is not `Ineligible`.
    pub eligible_job_count: i64,
    pub created_job_count: i64,
    pub pending_job_count: i64,
    pub inprogress_job_count: i64,
    pub succeeded_job_count: i64,
    pub failed_job_count: i64,
    pub canceled_job_count: i64,
    pub invalid_job_count: i64,
}

/// An item joined with its package read model and job tallies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemView {
    pub id: i64,
    pub upgrade_id: i64,
    pub push_request_id: String,
    pub package_org_id: String,
    pub version_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub status: PushStatus,
    pub created_by: Option<String>,
    /// Expected fan-out recorded at dispatch; `counts.job_count` is authoritative.
    pub total_job_count: i64,
    pub description: Option<String>,
    pub version_number: Option<String>,
    pub version_sort: Option<i64>,
    pub package_id: Option<String>,
    pub package_name: Option<String>,
    pub dependency_tier: i64,
    #[serde(flatten)]
    pub counts: JobCounts,
}

impl ItemView {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            upgrade_id: row.get("upgrade_id")?,
            push_request_id: row.get("push_request_id")?,
            package_org_id: row.get("package_org_id")?,
            version_id: row.get("version_id")?,
            start_time: timestamp_column(row, "start_time")?,
            status: row.get("status")?,
            created_by: row.get("created_by")?,
            total_job_count: row.get("total_job_count")?,
            description: row.get("description")?,
            version_number: row.get("version_number")?,
            version_sort: row.get("version_sort")?,
            package_id: row.get("package_id")?,
            package_name: row.get("package_name")?,
            dependency_tier: row.get("dependency_tier")?,
            counts: JobCounts {
                job_count: row.get("job_count")?,
                eligible_job_count: row.get("eligible_job_count")?,
                created_job_count: row.get("created_job_count")?,
                pending_job_count: row.get("pending_job_count")?,
                inprogress_job_count: row.get("inprogress_job_count")?,
                succeeded_job_count: row.get("succeeded_job_count")?,
                failed_job_count: row.get("failed_job_count")?,
                canceled_job_count: row.get("canceled_job_count")?,
                invalid_job_count: row.get("invalid_job_count")?,
            },
        })
    }

    /// Label used in activity messages, e.g. `Core 1.2`.
    pub fn label(&self) -> String {
        format!(
            "{} {}",
            self.package_name.as_deref().unwrap_or(&self.version_id),
            self.version_number.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string()
    }
}

/// Which items to list.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemFilter {
    Upgrade(i64),
    Package(String),
    PackageOrg(String),
    Ids(Vec<i64>),
    /// Pending or InProgress items whose start time has passed.
    Running { now: DateTime<Utc> },
}

const SELECT_ITEMS: &str = "SELECT i.id, i.upgrade_id, i.push_request_id, i.package_org_id,
        i.version_id, i.start_time, i.status, i.created_by, i.total_job_count,
        u.description,
        pv.version_number, pv.version_sort,
        p.sfid package_id, p.name package_name, COALESCE(p.dependency_tier, 0) dependency_tier,
        COUNT(j.id) job_count,
        COUNT(CASE WHEN j.status <> 'Ineligible' THEN 1 END) eligible_job_count,
        COUNT(CASE WHEN j.status = 'Created' THEN 1 END) created_job_count,
        COUNT(CASE WHEN j.status = 'Pending' THEN 1 END) pending_job_count,
        COUNT(CASE WHEN j.status = 'InProgress' THEN 1 END) inprogress_job_count,
        COUNT(CASE WHEN j.status = 'Succeeded' THEN 1 END) succeeded_job_count,
        COUNT(CASE WHEN j.status = 'Failed' THEN 1 END) failed_job_count,
        COUNT(CASE WHEN j.status = 'Canceled' THEN 1 END) canceled_job_count,
        COUNT(CASE WHEN j.status = 'Invalid' THEN 1 END) invalid_job_count
    FROM upgrade_item i
    INNER JOIN upgrade u ON u.id = i.upgrade_id
    LEFT JOIN package_version pv ON pv.version_id = i.version_id
    LEFT JOIN package p ON p.sfid = pv.package_id
    LEFT JOIN upgrade_job j ON j.item_id = i.id";

const GROUP_BY_ITEMS: &str = "GROUP BY i.id";

/// Inserts an item and returns its id.
pub fn insert(db: &Database, item: &NewItem) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO upgrade_item (upgrade_id, push_request_id, package_org_id, version_id,
             start_time, status, created_by, total_job_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.upgrade_id,
                item.push_request_id,
                item.package_org_id,
                item.version_id,
                item.start_time.map(format_timestamp),
                item.status,
                item.created_by,
                item.total_job_count,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Lists items matching a filter.
pub fn list(
    db: &Database,
    filter: &ItemFilter,
    sort: ItemSort,
    dir: SortDir,
) -> Result<Vec<ItemView>, DatabaseError> {
    db.with_conn(|conn| {
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let where_clause = match filter {
            ItemFilter::Upgrade(id) => {
                param_values.push(Box::new(*id));
                "WHERE i.upgrade_id = ?1".to_string()
            }
            ItemFilter::Package(package_id) => {
                param_values.push(Box::new(package_id.clone()));
                "WHERE p.sfid = ?1".to_string()
            }
            ItemFilter::PackageOrg(package_org_id) => {
                param_values.push(Box::new(package_org_id.clone()));
                "WHERE i.package_org_id = ?1".to_string()
            }
            ItemFilter::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                for id in ids {
                    param_values.push(Box::new(*id));
                }
                format!("WHERE i.id IN ({})", placeholders(1, ids.len()))
            }
            ItemFilter::Running { now } => {
                param_values.push(Box::new(PushStatus::Pending));
                param_values.push(Box::new(PushStatus::InProgress));
                param_values.push(Box::new(format_timestamp(*now)));
                "WHERE i.status IN (?1, ?2) AND COALESCE(i.start_time, '') <= ?3".to_string()
            }
        };

        let sql = format!(
            "{} {} {} {}",
            SELECT_ITEMS,
            where_clause,
            GROUP_BY_ITEMS,
            order_by(sort.columns(), dir)
        );
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), ItemView::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds one item view by id.
pub fn find_view_by_id(db: &Database, id: i64) -> Result<Option<ItemView>, DatabaseError> {
    Ok(list(db, &ItemFilter::Ids(vec![id]), ItemSort::Id, SortDir::Asc)?
        .into_iter()
        .next())
}

/// Updates the status of one item.
pub fn update_status(db: &Database, id: i64, status: PushStatus) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE upgrade_item SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    })
}

/// Corrects the expected job count of an item.
pub fn update_total_job_count(db: &Database, id: i64, count: i64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE upgrade_item SET total_job_count = ?1 WHERE id = ?2",
            params![count, id],
        )?;
        Ok(())
    })
}

/// Sets the status of items and of their jobs.
///
/// Jobs that already carry a message keep their status: the message holds a
/// diagnosed outcome that a blanket update must not hide.
pub fn update_status_with_jobs(
    db: &Database,
    item_ids: &[i64],
    status: PushStatus,
) -> Result<(), DatabaseError> {
    if item_ids.is_empty() {
        return Ok(());
    }
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let list = placeholders(2, item_ids.len());
        let mut param_values: Vec<&dyn rusqlite::types::ToSql> = vec![&status];
        for id in item_ids {
            param_values.push(id);
        }
        tx.execute(
            &format!("UPDATE upgrade_item SET status = ?1 WHERE id IN ({})", list),
            param_values.as_slice(),
        )?;
        tx.execute(
            &format!(
                "UPDATE upgrade_job SET status = ?1 WHERE message IS NULL AND item_id IN ({})",
                list
            ),
            param_values.as_slice(),
        )?;
        tx.commit()?;
        Ok(())
    })
}
