//! Shared SQLite connection setup for the record store and the queue.
//!
//! Both databases get the same durability settings:
//! - `journal_mode = WAL` for concurrency and crash safety
//! - `synchronous = FULL` so committed writes survive power loss
//! - `busy_timeout = 5000ms` to ride out short lock contention
//! - `foreign_keys = ON` so administrative deletes cascade
//!
//! Versioned migrations are tracked in a single-row `schema_version` table.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("failed to {operation}: {message}")]
pub struct DbSetupError {
    pub operation: &'static str,
    pub message: String,
}

impl DbSetupError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// One schema step: the version it produces and the SQL that gets there.
pub type Migration = (i64, &'static str);

/// Open (creating if needed) a database at `path` and bring it up to the
/// latest version in `migrations`.
///
/// `:memory:` opens a private in-memory database.
pub fn open_database<P: AsRef<Path>>(
    path: P,
    migrations: &[Migration],
) -> Result<Connection, DbSetupError> {
    let path_ref = path.as_ref();
    let path_str = path_ref.to_string_lossy();
    let is_in_memory = path_str == ":memory:";

    if !is_in_memory {
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbSetupError::new(
                        "create database directory",
                        format!("{}: {}", parent.display(), e),
                    )
                })?;
            }
        }
    }

    let conn = Connection::open(path_ref)
        .map_err(|e| DbSetupError::new("open database", e.to_string()))?;

    #[cfg(unix)]
    if !is_in_memory {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
            warn!("Failed to set restrictive permissions on database file: {}", e);
        }
    }

    // SQLite silently keeps DELETE mode on filesystems without shared memory
    // support, so check what we actually got.
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(|e| DbSetupError::new("set journal_mode", e.to_string()))?;

    let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
        || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
    if !journal_mode_ok {
        return Err(DbSetupError::new(
            "configure journal_mode",
            format!(
                "SQLite returned '{}' instead of 'wal'; the database directory must be on a \
                 filesystem that supports shared memory",
                journal_mode
            ),
        ));
    }

    conn.execute_batch(
        r#"
        PRAGMA synchronous = FULL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| DbSetupError::new("configure pragmas", e.to_string()))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DbSetupError::new("get schema version", e.to_string()))?
        .unwrap_or(0);

    run_migrations(&conn, current_version, migrations)?;

    Ok(conn)
}

fn run_migrations(
    conn: &Connection,
    from_version: i64,
    migrations: &[Migration],
) -> Result<(), DbSetupError> {
    let latest = migrations.iter().map(|(v, _)| *v).max().unwrap_or(0);

    if from_version > latest {
        return Err(DbSetupError::new(
            "check schema version",
            format!(
                "database schema version {} is newer than supported version {}; \
                 please upgrade the application",
                from_version, latest
            ),
        ));
    }

    for (version, sql) in migrations {
        if *version <= from_version {
            continue;
        }
        conn.execute_batch(sql)
            .map_err(|e| DbSetupError::new("run migration", format!("v{}: {}", version, e)))?;
    }

    if from_version != latest {
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![latest],
        )
        .map_err(|e| DbSetupError::new("update schema version", e.to_string()))?;
    }

    Ok(())
}

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
