//! Dynamic access to host tables named by aggregate declarations.
//!
//! Table and column names come from validated declarations and are always
//! double-quoted; values are always bound as parameters.

use rusqlite::{Connection, OptionalExtension};

use crate::record::Snapshot;
use crate::value::{Key, Value};

/// `[A-Za-z_][A-Za-z0-9_]*`
#[must_use]
pub fn is_valid_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier for interpolation into SQL.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Load every column of one row as a snapshot, or `None` if absent.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn load_row(
    conn: &Connection,
    table: &str,
    key_field: &str,
    key: &Key,
) -> rusqlite::Result<Option<Snapshot>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_ident(table),
        quote_ident(key_field)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    stmt.query_row([key], |row| {
        let mut snapshot = Snapshot::new();
        for (idx, name) in names.iter().enumerate() {
            snapshot.set(name.clone(), row.get::<_, Value>(idx)?);
        }
        Ok(snapshot)
    })
    .optional()
}

/// Page through the keys of a table in key order.
///
/// Returns at most `limit` keys strictly greater than `after`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_keys_after(
    conn: &Connection,
    table: &str,
    key_field: &str,
    after: Option<&Key>,
    limit: usize,
) -> rusqlite::Result<Vec<Key>> {
    let key = quote_ident(key_field);
    let sql = format!(
        "SELECT {key} FROM {table} WHERE {key} IS NOT NULL AND (?1 IS NULL OR {key} > ?1) \
         ORDER BY {key} LIMIT ?2",
        table = quote_ident(table),
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(rusqlite::params![after, limit], |row| row.get::<_, Key>(0))?;
    rows.collect()
}
