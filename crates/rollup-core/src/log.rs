//! Deferred operation log for asynchronous aggregates.
//!
//! Events for configurations marked `asynchronous` are not applied inline.
//! They are appended to `rollup_log` with both snapshots, both relevance
//! flags and the targets resolved at enqueue time. A drain (see
//! [`crate::engine::Engine::drain_pending`]) later replays them in creation
//! order.
//!
//! Drained entries are applied by recomputing their targets, so an entry
//! whose targets are all covered by later pending entries of the same
//! configuration is redundant: it is canceled instead of applied.

use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeSet;
use std::time::Instant;

use crate::config::CacheConfiguration;
use crate::db;
use crate::error::Result;
use crate::record::{Mutation, SourceEvent, SourceRecord, Snapshot};
use crate::value::Key;

/// Lifecycle of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Processed,
    Canceled,
    /// Processed, but the work failed permanently.
    Failed,
}

/// One row of `rollup_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub configuration: String,
    pub mutation: Mutation,
    pub old_snapshot: Snapshot,
    pub new_snapshot: Snapshot,
    pub old_relevant: bool,
    pub new_relevant: bool,
    pub target_keys: Vec<Key>,
    pub created_at_us: i64,
    pub processed_at_us: Option<i64>,
    pub canceled_at_us: Option<i64>,
    pub failure: Option<String>,
}

impl LogEntry {
    #[must_use]
    pub const fn status(&self) -> EntryStatus {
        if self.canceled_at_us.is_some() {
            EntryStatus::Canceled
        } else if self.failure.is_some() {
            EntryStatus::Failed
        } else if self.processed_at_us.is_some() {
            EntryStatus::Processed
        } else {
            EntryStatus::Pending
        }
    }

    /// Rebuild the source event the entry was enqueued for.
    #[must_use]
    pub fn event(&self, source_model: &str) -> SourceEvent {
        SourceEvent::new(
            self.mutation,
            SourceRecord::new(source_model, self.new_snapshot.clone())
                .with_original(self.old_snapshot.clone()),
        )
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get("entry_id")?,
            configuration: row.get("configuration")?,
            mutation: row.get("mutation")?,
            old_snapshot: row.get("old_snapshot")?,
            new_snapshot: row.get("new_snapshot")?,
            old_relevant: row.get("old_relevant")?,
            new_relevant: row.get("new_relevant")?,
            target_keys: row.get("target_keys")?,
            created_at_us: row.get("created_at_us")?,
            processed_at_us: row.get("processed_at_us")?,
            canceled_at_us: row.get("canceled_at_us")?,
            failure: row.get("failure")?,
        })
    }
}

struct RawEntry {
    id: i64,
    configuration: String,
    mutation: String,
    old_snapshot: String,
    new_snapshot: String,
    old_relevant: bool,
    new_relevant: bool,
    target_keys: String,
    created_at_us: i64,
    processed_at_us: Option<i64>,
    canceled_at_us: Option<i64>,
    failure: Option<String>,
}

impl RawEntry {
    fn decode(self) -> Result<LogEntry> {
        let mutation = self.mutation.parse::<Mutation>().map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;
        Ok(LogEntry {
            id: self.id,
            configuration: self.configuration,
            mutation,
            old_snapshot: serde_json::from_str(&self.old_snapshot)?,
            new_snapshot: serde_json::from_str(&self.new_snapshot)?,
            old_relevant: self.old_relevant,
            new_relevant: self.new_relevant,
            target_keys: serde_json::from_str(&self.target_keys)?,
            created_at_us: self.created_at_us,
            processed_at_us: self.processed_at_us,
            canceled_at_us: self.canceled_at_us,
            failure: self.failure,
        })
    }
}

const ENTRY_COLUMNS: &str = "entry_id, configuration, mutation, old_snapshot, new_snapshot, \
     old_relevant, new_relevant, target_keys, created_at_us, processed_at_us, \
     canceled_at_us, failure";

const PENDING: &str = "processed_at_us IS NULL AND canceled_at_us IS NULL";

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Append an entry for `event` under `config`.
///
/// # Errors
///
/// Returns an error if snapshots cannot be encoded or the insert fails.
pub fn enqueue(
    conn: &Connection,
    config: &CacheConfiguration,
    event: &SourceEvent,
    relevance: (bool, bool),
    target_keys: &[Key],
) -> Result<i64> {
    let (old_relevant, new_relevant) = relevance;
    conn.execute(
        "INSERT INTO rollup_log (
            configuration, mutation, old_snapshot, new_snapshot,
            old_relevant, new_relevant, target_keys, created_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            config.name,
            event.mutation.as_str(),
            serde_json::to_string(&event.record.original)?,
            serde_json::to_string(&event.record.current)?,
            old_relevant,
            new_relevant,
            serde_json::to_string(target_keys)?,
            db::now_us(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!(
        entry_id = id,
        configuration = %config.name,
        mutation = %event.mutation,
        targets = target_keys.len(),
        "deferred operation enqueued"
    );
    Ok(id)
}

/// Mark an entry applied.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn mark_processed(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE rollup_log SET processed_at_us = ?1 WHERE entry_id = ?2",
        params![db::now_us(), id],
    )?;
    Ok(())
}

/// Mark an entry superseded by later entries.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn mark_canceled(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE rollup_log SET canceled_at_us = ?1 WHERE entry_id = ?2",
        params![db::now_us(), id],
    )?;
    Ok(())
}

/// Mark an entry processed with a permanent failure note.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn mark_failed(conn: &Connection, id: i64, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE rollup_log SET processed_at_us = ?1, failure = ?2 WHERE entry_id = ?3",
        params![db::now_us(), reason, id],
    )?;
    Ok(())
}

/// Delete entries applied successfully before `before_us`.
///
/// Canceled tombstones and failure notes are kept for auditing.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn prune_finished(conn: &Connection, before_us: i64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM rollup_log
         WHERE processed_at_us IS NOT NULL AND processed_at_us < ?1
           AND canceled_at_us IS NULL AND failure IS NULL",
        [before_us],
    )?;
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Oldest pending entries, at most `limit`.
///
/// # Errors
///
/// Returns an error if the query fails or a row cannot be decoded.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<LogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM rollup_log WHERE {PENDING}
         ORDER BY created_at_us, entry_id LIMIT ?1"
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare_cached(&sql)?;
    let raw = stmt
        .query_map([limit], LogEntry::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawEntry::decode).collect()
}

/// Number of pending entries.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn pending_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM rollup_log WHERE {PENDING}"),
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Fetch one entry by id.
///
/// # Errors
///
/// Returns an error if the query fails or the row cannot be decoded.
pub fn get_entry(conn: &Connection, id: i64) -> Result<Option<LogEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM rollup_log WHERE entry_id = ?1");
    let raw = conn
        .query_row(&sql, [id], LogEntry::from_row)
        .optional()?;
    raw.map(RawEntry::decode).transpose()
}

/// True when later pending entries of the same configuration cover every
/// target of `entry`.
///
/// Entries without targets are never superseded; they drain as no-ops.
///
/// # Errors
///
/// Returns an error if the query fails or stored keys cannot be decoded.
pub fn is_superseded(conn: &Connection, entry: &LogEntry) -> Result<bool> {
    if entry.target_keys.is_empty() {
        return Ok(false);
    }
    let sql = format!(
        "SELECT target_keys FROM rollup_log
         WHERE configuration = ?1 AND {PENDING}
           AND (created_at_us > ?2 OR (created_at_us = ?2 AND entry_id > ?3))"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let later = stmt
        .query_map(
            params![entry.configuration, entry.created_at_us, entry.id],
            |row| row.get::<_, String>(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut covered: BTreeSet<Key> = BTreeSet::new();
    for keys in later {
        covered.extend(serde_json::from_str::<Vec<Key>>(&keys)?);
    }
    Ok(entry.target_keys.iter().all(|key| covered.contains(key)))
}

// ---------------------------------------------------------------------------
// Drain bookkeeping
// ---------------------------------------------------------------------------

/// Bounds for one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    pub batch_size: usize,
    pub deadline: Option<Instant>,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            deadline: None,
        }
    }
}

impl DrainOptions {
    pub(crate) fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub canceled: usize,
    pub failed: usize,
    /// Entries left pending because storage was busy; retried next cycle.
    pub deferred: usize,
}

impl DrainReport {
    #[must_use]
    pub const fn handled(&self) -> usize {
        self.applied + self.canceled + self.failed
    }
}
