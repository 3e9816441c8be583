//! Engine-owned SQLite tables.
//!
//! Host tables (sources, targets, pivots) belong to the host and are never
//! created here. The engine only adds:
//! - `rollup_log`, the deferred-operation log for asynchronous aggregates
//! - `rollup_meta`, schema version plus drain and refresh bookkeeping

/// Migration v1: deferred log plus engine metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rollup_log (
    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
    configuration TEXT NOT NULL CHECK (length(trim(configuration)) > 0),
    mutation TEXT NOT NULL CHECK (mutation IN ('created', 'updated', 'deleted', 'restored')),
    old_snapshot TEXT NOT NULL,
    new_snapshot TEXT NOT NULL,
    old_relevant INTEGER NOT NULL CHECK (old_relevant IN (0, 1)),
    new_relevant INTEGER NOT NULL CHECK (new_relevant IN (0, 1)),
    target_keys TEXT NOT NULL DEFAULT '[]',
    created_at_us INTEGER NOT NULL,
    processed_at_us INTEGER,
    canceled_at_us INTEGER,
    failure TEXT,
    CHECK (processed_at_us IS NULL OR canceled_at_us IS NULL)
);

CREATE TABLE IF NOT EXISTS rollup_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_drain_at_us INTEGER NOT NULL DEFAULT 0,
    last_refresh_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO rollup_meta (id, schema_version) VALUES (1, 1);

CREATE INDEX IF NOT EXISTS idx_rollup_log_pending
    ON rollup_log(created_at_us, entry_id)
    WHERE processed_at_us IS NULL AND canceled_at_us IS NULL;

CREATE INDEX IF NOT EXISTS idx_rollup_log_configuration
    ON rollup_log(configuration, created_at_us, entry_id);
";

/// Indexes that must exist after migrating to the latest schema.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_rollup_log_pending",
    "idx_rollup_log_configuration",
];

#[cfg(test)]
mod tests {
    use super::MIGRATION_V1_SQL;
    use rusqlite::Connection;

    #[test]
    fn log_rejects_entries_both_processed_and_canceled() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(MIGRATION_V1_SQL).expect("apply schema");

        let result = conn.execute(
            "INSERT INTO rollup_log (
                configuration, mutation, old_snapshot, new_snapshot,
                old_relevant, new_relevant, created_at_us, processed_at_us, canceled_at_us
            ) VALUES ('c', 'updated', '{}', '{}', 1, 1, 1, 2, 3)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn log_rejects_unknown_mutation() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(MIGRATION_V1_SQL).expect("apply schema");

        let result = conn.execute(
            "INSERT INTO rollup_log (
                configuration, mutation, old_snapshot, new_snapshot,
                old_relevant, new_relevant, created_at_us
            ) VALUES ('c', 'archived', '{}', '{}', 0, 1, 1)",
            [],
        );
        assert!(result.is_err());
    }
}
