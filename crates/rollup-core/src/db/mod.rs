//! SQLite plumbing shared by every engine component.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so readers proceed while the engine writes
//! - `busy_timeout = 5s` to absorb short lock contention
//! - `foreign_keys = ON` to keep host relations intact

pub mod migrations;
pub mod rows;
pub mod schema;

pub use rows::{is_valid_identifier, list_keys_after, load_row, quote_ident};

use anyhow::Context;
use rusqlite::Connection;
use std::{path::Path, time::Duration};

use crate::error::Result;

/// Busy timeout used for engine connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the host database, apply runtime pragmas and migrate the
/// engine-owned tables to the latest version.
///
/// # Errors
///
/// Returns an error if opening, configuring or migrating the database fails.
pub fn open_store(path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }

    let mut conn =
        Connection::open(path).with_context(|| format!("open database {}", path.display()))?;

    prepare(&mut conn).context("prepare rollup store")?;

    Ok(conn)
}

/// Configure pragmas and migrate an already-open connection.
///
/// Used for in-memory databases and for hosts that manage their own
/// connection lifecycle.
///
/// # Errors
///
/// Returns an error if a pragma or migration fails.
pub fn prepare(conn: &mut Connection) -> rusqlite::Result<u32> {
    configure_connection(conn)?;
    migrations::migrate(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Run `work` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error.
///
/// # Errors
///
/// Returns the error from `work`, or the storage error if the transaction
/// cannot be opened or committed.
pub fn with_immediate_transaction<T>(
    conn: &Connection,
    work: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match work(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %rollback, "rollback after failed unit of work");
            }
            Err(err)
        }
    }
}

/// Wall-clock microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
