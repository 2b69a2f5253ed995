//! SQLite hierarchy store utilities.
//!
//! Runtime defaults are intentionally conservative:
//! - `journal_mode = WAL` to allow concurrent readers while writers append
//! - `busy_timeout = 5s` to reduce transient lock failures under contention
//! - `foreign_keys = ON` so `parent_id` always references a real node

pub mod migrations;
pub mod query;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

/// Busy timeout used when the caller does not supply one.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the hierarchy SQLite database, apply runtime pragmas,
/// and migrate schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_store(path: &Path) -> Result<Connection> {
    open_store_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
}

/// Same as [`open_store`] with an explicit busy timeout, for callers that
/// load one from configuration.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_store_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create hierarchy db directory {}", parent.display()))?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open hierarchy database {}", path.display()))?;

    configure_connection(&conn, busy_timeout).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply hierarchy migrations")?;

    Ok(conn)
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}
