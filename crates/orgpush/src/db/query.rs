//! Shared query building blocks: sort whitelists and timestamp columns.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Sort direction for list queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    fn as_sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

impl FromStr for SortDir {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(format!("invalid sort direction '{}'", other)),
        }
    }
}

/// Builds an `ORDER BY` clause applying `dir` to every column.
pub(crate) fn order_by(columns: &[&str], dir: SortDir) -> String {
    let parts: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", c, dir.as_sql()))
        .collect();
    format!("ORDER BY {}", parts.join(", "))
}

/// Sortable upgrade columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeSort {
    Id,
    #[default]
    StartTime,
    Status,
    CreatedBy,
    Description,
}

impl UpgradeSort {
    pub(crate) fn columns(&self) -> &'static [&'static str] {
        match self {
            UpgradeSort::Id => &["u.id"],
            UpgradeSort::StartTime => &["u.start_time", "u.id"],
            UpgradeSort::Status => &["u.status", "u.id"],
            UpgradeSort::CreatedBy => &["u.created_by", "u.id"],
            UpgradeSort::Description => &["u.description", "u.id"],
        }
    }
}

/// Sortable item columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSort {
    Id,
    #[default]
    PushRequestId,
    Status,
    StartTime,
    PackageName,
    VersionNumber,
    /// Dependency tier, then package, then version order.
    Activation,
}

impl ItemSort {
    pub(crate) fn columns(&self) -> &'static [&'static str] {
        match self {
            ItemSort::Id => &["i.id"],
            ItemSort::PushRequestId => &["i.push_request_id", "i.id"],
            ItemSort::Status => &["i.status", "i.id"],
            ItemSort::StartTime => &["i.start_time", "i.id"],
            ItemSort::PackageName => &["package_name", "i.id"],
            ItemSort::VersionNumber => &["version_sort", "i.id"],
            ItemSort::Activation => &["dependency_tier", "package_id", "version_sort", "i.id"],
        }
    }
}

/// Sortable job columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSort {
    Id,
    #[default]
    OrgId,
    Status,
    PackageName,
    VersionNumber,
}

impl JobSort {
    pub(crate) fn columns(&self) -> &'static [&'static str] {
        match self {
            JobSort::Id => &["j.id"],
            JobSort::OrgId => &["j.org_id", "j.id"],
            JobSort::Status => &["j.status", "j.id"],
            JobSort::PackageName => &["package_name", "j.id"],
            JobSort::VersionNumber => &["version_sort", "j.id"],
        }
    }
}

/// Formats a timestamp for storage. Fixed width so text comparison in SQL
/// orders the same way as the instants.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Reads a nullable RFC 3339 column.
pub(crate) fn timestamp_column(
    row: &Row<'_>,
    name: &str,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(name)?;
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                let idx = row.as_ref().column_index(name).unwrap_or_default();
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            }),
    }
}
