//! Upgrade job repository: one row per subscriber org of a push request.

use chrono::{DateTime, Utc};
use rusqlite::{params, types::ToSql, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::query::{format_timestamp, order_by, timestamp_column, JobSort, SortDir};
use super::{placeholders, Database, DatabaseError};
use crate::status::PushStatus;

/// Values for a new job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Remote job id; `None` when no remote job could be created.
    pub job_id: Option<String>,
    pub org_id: String,
    pub status: PushStatus,
    pub message: Option<String>,
    pub original_version_id: Option<String>,
}

/// A job joined with its item and the package read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: i64,
    pub upgrade_id: i64,
    pub item_id: i64,
    pub push_request_id: String,
    pub job_id: Option<String>,
    pub org_id: String,
    pub status: PushStatus,
    pub message: Option<String>,
    pub package_org_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub version_id: String,
    pub version_number: Option<String>,
    pub version_sort: Option<i64>,
    pub package_id: Option<String>,
    pub package_name: Option<String>,
    pub dependency_tier: i64,
    pub current_version_id: Option<String>,
    pub current_version_number: Option<String>,
    pub original_version_id: Option<String>,
    pub original_version_number: Option<String>,
}

impl JobView {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            upgrade_id: row.get("upgrade_id")?,
            item_id: row.get("item_id")?,
            push_request_id: row.get("push_request_id")?,
            job_id: row.get("job_id")?,
            org_id: row.get("org_id")?,
            status: row.get("status")?,
            message: row.get("message")?,
            package_org_id: row.get("package_org_id")?,
            start_time: timestamp_column(row, "start_time")?,
            created_by: row.get("created_by")?,
            version_id: row.get("version_id")?,
            version_number: row.get("version_number")?,
            version_sort: row.get("version_sort")?,
            package_id: row.get("package_id")?,
            package_name: row.get("package_name")?,
            dependency_tier: row.get("dependency_tier")?,
            current_version_id: row.get("current_version_id")?,
            current_version_number: row.get("current_version_number")?,
            original_version_id: row.get("original_version_id")?,
            original_version_number: row.get("original_version_number")?,
        })
    }
}

/// Job list filter. Every set field narrows the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub upgrade_id: Option<i64>,
    pub item_id: Option<i64>,
    pub org_id: Option<String>,
    pub ids: Option<Vec<i64>>,
    pub statuses: Vec<PushStatus>,
    /// Only jobs whose item has started by this instant.
    pub started_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn by_upgrade(upgrade_id: i64) -> Self {
        Self {
            upgrade_id: Some(upgrade_id),
            ..Default::default()
        }
    }

    pub fn by_item(item_id: i64) -> Self {
        Self {
            item_id: Some(item_id),
            ..Default::default()
        }
    }

    pub fn by_org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
            ..Default::default()
        }
    }

    /// Pending or InProgress jobs whose item start time has passed.
    pub fn running(now: DateTime<Utc>) -> Self {
        Self {
            statuses: PushStatus::RUNNING.to_vec(),
            started_before: Some(now),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[PushStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }
}

/// Status and message to write back for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: i64,
    pub status: PushStatus,
    pub message: Option<String>,
}

const SELECT_JOBS: &str = "SELECT j.id, j.upgrade_id, j.item_id, j.push_request_id, j.job_id,
        j.org_id, j.status, j.message,
        i.package_org_id, i.start_time, i.created_by, i.version_id,
        pv.version_number version_number, pv.version_sort version_sort,
        p.sfid package_id, p.name package_name, COALESCE(p.dependency_tier, 0) dependency_tier,
        opv.version_id current_version_id, pvc.version_number current_version_number,
        j.original_version_id, pvo.version_number original_version_number
    FROM upgrade_job j
    INNER JOIN upgrade_item i ON i.id = j.item_id
    LEFT JOIN package_version pv ON pv.version_id = i.version_id
    LEFT JOIN package p ON p.sfid = pv.package_id
    LEFT JOIN org_package_version opv ON opv.package_id = pv.package_id AND opv.org_id = j.org_id
    LEFT JOIN package_version pvc ON pvc.version_id = opv.version_id
    LEFT JOIN package_version pvo ON pvo.version_id = j.original_version_id";

/// Inserts the jobs of one push request in a single transaction.
/// Returns the new row ids in input order.
pub fn insert_batch(
    db: &Database,
    upgrade_id: i64,
    item_id: i64,
    push_request_id: &str,
    jobs: &[NewJob],
) -> Result<Vec<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(jobs.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO upgrade_job (upgrade_id, item_id, push_request_id, job_id, org_id,
                 status, message, original_version_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for job in jobs {
                stmt.execute(params![
                    upgrade_id,
                    item_id,
                    push_request_id,
                    job.job_id,
                    job.org_id,
                    job.status,
                    job.message,
                    job.original_version_id,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        log::debug!("Inserted {} jobs for item {}", ids.len(), item_id);
        Ok(ids)
    })
}

/// Lists jobs matching a filter.
pub fn list(
    db: &Database,
    filter: &JobFilter,
    sort: JobSort,
    dir: SortDir,
) -> Result<Vec<JobView>, DatabaseError> {
    if matches!(&filter.ids, Some(ids) if ids.is_empty()) {
        return Ok(Vec::new());
    }

    db.with_conn(|conn| {
        let mut conditions: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(id) = filter.upgrade_id {
            param_values.push(Box::new(id));
            conditions.push(format!("j.upgrade_id = ?{}", param_values.len()));
        }
        if let Some(id) = filter.item_id {
            param_values.push(Box::new(id));
            conditions.push(format!("j.item_id = ?{}", param_values.len()));
        }
        if let Some(ref org_id) = filter.org_id {
            param_values.push(Box::new(org_id.clone()));
            conditions.push(format!("j.org_id = ?{}", param_values.len()));
        }
        if let Some(ref ids) = filter.ids {
            let first = param_values.len() + 1;
            for id in ids {
                param_values.push(Box::new(*id));
            }
            conditions.push(format!("j.id IN ({})", placeholders(first, ids.len())));
        }
        if !filter.statuses.is_empty() {
            let first = param_values.len() + 1;
            for status in &filter.statuses {
                param_values.push(Box::new(*status));
            }
            conditions.push(format!(
                "j.status IN ({})",
                placeholders(first, filter.statuses.len())
            ));
        }
        if let Some(now) = filter.started_before {
            param_values.push(Box::new(format_timestamp(now)));
            conditions.push(format!(
                "COALESCE(i.start_time, '') <= ?{}",
                param_values.len()
            ));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "{} {} {}",
            SELECT_JOBS,
            where_clause,
            order_by(sort.columns(), dir)
        );

        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), JobView::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds one job view by id.
pub fn find_view_by_id(db: &Database, id: i64) -> Result<Option<JobView>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                &format!("{} WHERE j.id = ?1", SELECT_JOBS),
                params![id],
                JobView::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Writes status and message of many jobs in one transaction.
pub fn update_statuses(db: &Database, updates: &[JobUpdate]) -> Result<usize, DatabaseError> {
    if updates.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE upgrade_job SET status = ?1, message = ?2 WHERE id = ?3")?;
            for update in updates {
                changed += stmt.execute(params![update.status, update.message, update.id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    })
}

/// Sets the status of one job, leaving its message untouched.
pub fn update_status(db: &Database, id: i64, status: PushStatus) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE upgrade_job SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::catalog_repo::{self, PackageRow, PackageVersionRow};
    use crate::db::item_repo::{self, NewItem};
    use crate::db::upgrade_repo;
    use chrono::TimeZone;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn seed_catalog(db: &Database) {
        catalog_repo::upsert_package(
            db,
            &PackageRow {
                sfid: "033A".to_string(),
                name: "Core".to_string(),
                package_org_id: "00DP".to_string(),
                dependency_tier: 1,
            },
        )
        .unwrap();
        for (id, number, sort) in [("04tOld", "1.0", 1), ("04tNew", "2.0", 2)] {
            catalog_repo::upsert_package_version(
                db,
                &PackageVersionRow {
                    version_id: id.to_string(),
                    package_id: "033A".to_string(),
                    version_number: number.to_string(),
                    version_sort: sort,
                },
            )
            .unwrap();
        }
    }

    fn seed_item(db: &Database, start: Option<DateTime<Utc>>) -> (i64, i64) {
        let up = upgrade_repo::insert(db, start, Some("alice"), None).unwrap();
        let item = item_repo::insert(
            db,
            &NewItem {
                upgrade_id: up.id,
                push_request_id: "0DVreq".to_string(),
                package_org_id: "00DP".to_string(),
                version_id: "04tNew".to_string(),
                start_time: start,
                status: PushStatus::Created,
                created_by: Some("alice".to_string()),
                total_job_count: 2,
            },
        )
        .unwrap();
        (up.id, item)
    }

    fn new_job(job_id: Option<&str>, org: &str, status: PushStatus) -> NewJob {
        NewJob {
            job_id: job_id.map(str::to_string),
            org_id: org.to_string(),
            status,
            message: None,
            original_version_id: Some("04tOld".to_string()),
        }
    }

    #[test]
    fn test_insert_batch_and_view() {
        let db = test_db();
        seed_catalog(&db);
        let (upgrade_id, item_id) = seed_item(&db, None);
        catalog_repo::upsert_installed_version(&db, "00DS1", "033A", "04tOld", Utc::now())
            .unwrap();

        let ids = insert_batch(
            &db,
            upgrade_id,
            item_id,
            "0DVreq",
            &[
                new_job(Some("0Hx000000000001"), "00DS1", PushStatus::Created),
                new_job(None, "00DS2", PushStatus::Ineligible),
            ],
        )
        .unwrap();
        assert_eq!(ids.len(), 2);

        let job = find_view_by_id(&db, ids[0]).unwrap().unwrap();
        assert_eq!(job.package_name.as_deref(), Some("Core"));
        assert_eq!(job.version_number.as_deref(), Some("2.0"));
        assert_eq!(job.current_version_number.as_deref(), Some("1.0"));
        assert_eq!(job.original_version_number.as_deref(), Some("1.0"));
        assert_eq!(job.package_org_id, "00DP");
        assert_eq!(job.dependency_tier, 1);

        let second = find_view_by_id(&db, ids[1]).unwrap().unwrap();
        assert!(second.job_id.is_none());
        assert!(second.current_version_id.is_none());
        assert!(find_view_by_id(&db, 999).unwrap().is_none());
    }

    #[test]
    fn test_list_filters_combine() {
        let db = test_db();
        let (upgrade_id, item_id) = seed_item(&db, None);
        insert_batch(
            &db,
            upgrade_id,
            item_id,
            "0DVreq",
            &[
                new_job(Some("a"), "00DS1", PushStatus::Pending),
                new_job(Some("b"), "00DS2", PushStatus::Succeeded),
                new_job(Some("c"), "00DS3", PushStatus::InProgress),
            ],
        )
        .unwrap();

        let all = list(&db, &JobFilter::by_upgrade(upgrade_id), JobSort::default(), SortDir::Desc)
            .unwrap();
        let orgs: Vec<&str> = all.iter().map(|j| j.org_id.as_str()).collect();
        assert_eq!(orgs, vec!["00DS3", "00DS2", "00DS1"]);

        let succeeded = list(
            &db,
            &JobFilter::by_item(item_id).with_statuses(&[PushStatus::Succeeded]),
            JobSort::Id,
            SortDir::Asc,
        )
        .unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].org_id, "00DS2");

        let one_org = list(&db, &JobFilter::by_org("00DS1"), JobSort::Id, SortDir::Asc).unwrap();
        assert_eq!(one_org.len(), 1);

        let running = list(&db, &JobFilter::running(Utc::now()), JobSort::Id, SortDir::Asc).unwrap();
        assert_eq!(running.len(), 2);

        let none = JobFilter {
            ids: Some(vec![]),
            ..Default::default()
        };
        assert!(list(&db, &none, JobSort::Id, SortDir::Asc).unwrap().is_empty());
    }

    #[test]
    fn test_running_respects_item_start_time() {
        let db = test_db();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let (upgrade_id, item_id) = seed_item(&db, Some(now + chrono::Duration::minutes(5)));
        insert_batch(
            &db,
            upgrade_id,
            item_id,
            "0DVreq",
            &[new_job(Some("a"), "00DS1", PushStatus::Pending)],
        )
        .unwrap();

        assert!(list(&db, &JobFilter::running(now), JobSort::Id, SortDir::Asc)
            .unwrap()
            .is_empty());
        let later = now + chrono::Duration::minutes(10);
        assert_eq!(
            list(&db, &JobFilter::running(later), JobSort::Id, SortDir::Asc)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_update_statuses_writes_message() {
        let db = test_db();
        let (upgrade_id, item_id) = seed_item(&db, None);
        let ids = insert_batch(
            &db,
            upgrade_id,
            item_id,
            "0DVreq",
            &[
                new_job(Some("a"), "00DS1", PushStatus::Pending),
                new_job(Some("b"), "00DS2", PushStatus::Pending),
            ],
        )
        .unwrap();

        let changed = update_statuses(
            &db,
            &[
                JobUpdate {
                    id: ids[0],
                    status: PushStatus::Failed,
                    message: Some("[]".to_string()),
                },
                JobUpdate {
                    id: ids[1],
                    status: PushStatus::Succeeded,
                    message: None,
                },
            ],
        )
        .unwrap();
        assert_eq!(changed, 2);

        let failed = find_view_by_id(&db, ids[0]).unwrap().unwrap();
        assert_eq!(failed.status, PushStatus::Failed);
        assert_eq!(failed.message.as_deref(), Some("[]"));

        update_status(&db, ids[0], PushStatus::Canceled).unwrap();
        let canceled = find_view_by_id(&db, ids[0]).unwrap().unwrap();
        assert_eq!(canceled.status, PushStatus::Canceled);
        assert_eq!(canceled.message.as_deref(), Some("[]"));
        assert_eq!(update_statuses(&db, &[]).unwrap(), 0);
    }
}
