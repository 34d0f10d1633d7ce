//! Schema migrations.
//!
//! Tracks applied migrations in a `_migrations` table and applies pending
//! ones in order. The catalog table may already exist when a scanner
//! created it, so table creation is `IF NOT EXISTS` and the lease columns
//! are added only when missing.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_file_inventory",
        sql: include_str!("sql/001_create_file_inventory.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_mount_info",
        sql: include_str!("sql/002_create_mount_info.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_transcription_log",
        sql: include_str!("sql/003_create_transcription_log.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_transcript_segment",
        sql: include_str!("sql/004_create_transcript_segment.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_lease_owner_to_file_inventory",
        sql: include_str!("sql/005_add_lease_owner.sql"),
        kind: MigrationKind::AddColumn {
            table: "file_inventory",
            column: "lease_owner",
        },
    },
    Migration {
        version: 6,
        description: "add_lease_expires_at_to_file_inventory",
        sql: include_str!("sql/006_add_lease_expires_at.sql"),
        kind: MigrationKind::AddColumn {
            table: "file_inventory",
            column: "lease_expires_at",
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

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
        assert!(column_exists(&conn, "file_inventory", "lease_owner").unwrap());
        assert!(column_exists(&conn, "file_inventory", "lease_expires_at").unwrap());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_existing_scanner_catalog_is_adopted() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE file_inventory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                md5 TEXT,
                size INTEGER,
                mime_type TEXT,
                mount_uuid TEXT,
                relative_path TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT
            );
            INSERT INTO file_inventory (path, md5) VALUES ('/media/a.wav', 'aaa');",
        )
        .unwrap();

        run_all(&conn).unwrap();

        assert!(column_exists(&conn, "file_inventory", "lease_expires_at").unwrap());
        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM file_inventory", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_column_exists_check() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE test_tbl (id TEXT, name TEXT);")
            .unwrap();

        assert!(column_exists(&conn, "test_tbl", "id").unwrap());
        assert!(!column_exists(&conn, "test_tbl", "missing").unwrap());
        assert!(column_exists(&conn, "bad name;", "id").is_err());
    }

    #[test]
    fn test_run_status_is_constrained() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO transcription_log (file_id, path, status, started_at, ended_at,
             duration_secs, model_identity, run_version)
             VALUES (1, '/a.wav', 'running', 't', 't', 0, 'm', 'v1')",
            [],
        );
        assert!(result.is_err());
    }
}
