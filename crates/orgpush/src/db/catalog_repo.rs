//! Package catalog read model: packages, versions and installed versions.
//!
//! These tables are maintained outside the upgrade engine. The engine reads
//! them for ordering and display and writes only `org_package_version` when
//! a push job succeeds.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::query::format_timestamp;
use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRow {
    pub sfid: String,
    pub name: String,
    pub package_org_id: String,
    pub dependency_tier: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersionRow {
    pub version_id: String,
    pub package_id: String,
    pub version_number: String,
    pub version_sort: i64,
}

/// Inserts or replaces a package.
pub fn upsert_package(db: &Database, package: &PackageRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO package (sfid, name, package_org_id, dependency_tier)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sfid) DO UPDATE SET name = excluded.name,
               package_org_id = excluded.package_org_id,
               dependency_tier = excluded.dependency_tier",
            params![
                package.sfid,
                package.name,
                package.package_org_id,
                package.dependency_tier
            ],
        )?;
        Ok(())
    })
}

/// Inserts or replaces a package version.
pub fn upsert_package_version(
    db: &Database,
    version: &PackageVersionRow,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO package_version (version_id, package_id, version_number, version_sort)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(version_id) DO UPDATE SET package_id = excluded.package_id,
               version_number = excluded.version_number,
               version_sort = excluded.version_sort",
            params![
                version.version_id,
                version.package_id,
                version.version_number,
                version.version_sort
            ],
        )?;
        Ok(())
    })
}

pub fn find_version(
    db: &Database,
    version_id: &str,
) -> Result<Option<PackageVersionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT version_id, package_id, version_number, version_sort
                 FROM package_version WHERE version_id = ?1",
                params![version_id],
                |r| {
                    Ok(PackageVersionRow {
                        version_id: r.get(0)?,
                        package_id: r.get(1)?,
                        version_number: r.get(2)?,
                        version_sort: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

/// Records the version of a package currently installed in an org.
pub fn upsert_installed_version(
    db: &Database,
    org_id: &str,
    package_id: &str,
    version_id: &str,
    installed_at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO org_package_version (org_id, package_id, version_id, install_date)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(org_id, package_id) DO UPDATE SET version_id = excluded.version_id,
               install_date = excluded.install_date",
            params![org_id, package_id, version_id, format_timestamp(installed_at)],
        )?;
        Ok(())
    })
}

/// Returns the version id installed in an org for a package, if known.
pub fn find_installed_version(
    db: &Database,
    org_id: &str,
    package_id: &str,
) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let version = conn
            .query_row(
                "SELECT version_id FROM org_package_version WHERE org_id = ?1 AND package_id = ?2",
                params![org_id, package_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(version)
    })
}
