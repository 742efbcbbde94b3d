//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order. Column additions are skipped when the column
//! is already present so a hand-patched database can still be opened.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN; skip if column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_package_catalog",
        sql: include_str!("sql/001_create_package_catalog.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_upgrades",
        sql: include_str!("sql/002_create_upgrades.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "add_original_version_to_upgrade_job",
        sql: include_str!("sql/003_add_original_version.sql"),
        kind: MigrationKind::AddColumn {
            table: "upgrade_job",
            column: "original_version_id",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (column already present)",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = fresh();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = fresh();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_upgrade_job_has_original_version() {
        let conn = fresh();
        run_all(&conn).unwrap();
        assert!(column_exists(&conn, "upgrade_job", "original_version_id").unwrap());
        assert!(column_exists(&conn, "upgrade_job", "message").unwrap());
    }

    #[test]
    fn test_add_column_skipped_when_present() {
        let conn = fresh();
        // Simulate a database patched by hand before versioning existed.
        conn.execute_batch(include_str!("sql/001_create_package_catalog.sql"))
            .unwrap();
        conn.execute_batch(include_str!("sql/002_create_upgrades.sql"))
            .unwrap();
        conn.execute_batch(include_str!("sql/003_add_original_version.sql"))
            .unwrap();

        run_all(&conn).unwrap();
        assert!(column_exists(&conn, "upgrade_job", "original_version_id").unwrap());
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let conn = fresh();
        assert!(column_exists(&conn, "upgrade; DROP TABLE x", "id").is_err());
    }
}
