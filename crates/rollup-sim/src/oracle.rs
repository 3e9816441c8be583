use anyhow::{Context, Result};
use rollup_core::db::{list_keys_after, load_row};
use rollup_core::recompute::values_match;
use rollup_core::{Aggregate, Engine, Key, Registry, Value};
use rusqlite::Connection;

// ── Core result types ─────────────────────────────────────────────────────────

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// Diagnostic information for a single failed invariant check.
#[derive(Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// A stored summary differs from its full recompute.
    Drift {
        model: String,
        key: Key,
        field: String,
        stored: Value,
        expected: Value,
    },

    /// A count summary went below zero.
    NegativeCount {
        model: String,
        key: Key,
        field: String,
        value: Value,
    },

    /// Log entries still pending after the final drain.
    PendingEntries { count: u64 },

    /// Log entries whose deferred work failed permanently.
    FailedEntries { count: u64 },
}

// ── Oracle ───────────────────────────────────────────────────────────────────

/// Checks a settled host against the closed-form definition of every
/// summary. Reads only; a drifted row is reported, never repaired.
pub struct CacheOracle;

impl CacheOracle {
    /// Run every check over every target model.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn check_all(conn: &Connection, registry: &Registry) -> Result<OracleResult> {
        let mut result = OracleResult::pass();
        for model in registry.target_models() {
            result = result
                .merge(Self::check_drift(conn, registry, model)?)
                .merge(Self::check_counts(conn, registry, model)?);
        }
        Ok(result.merge(Self::check_log(conn)?))
    }

    /// Every summary field of every row equals its recompute.
    ///
    /// # Errors
    ///
    /// Returns an error if a row or recompute query fails.
    pub fn check_drift(
        conn: &Connection,
        registry: &Registry,
        model: &str,
    ) -> Result<OracleResult> {
        let Some(key_field) = registry.key_field(model) else {
            return Ok(OracleResult::pass());
        };
        let engine = Engine::new(conn, registry);
        let mut violations = Vec::new();

        for key in all_keys(conn, model, key_field)? {
            let Some(row) = load_row(conn, model, key_field, &key)? else {
                continue;
            };
            let expected = engine
                .recompute(model, &key)
                .with_context(|| format!("recompute {model}[{key}]"))?;
            for (field, expected) in expected {
                let stored = row.value(&field);
                if !values_match(&stored, &expected) {
                    violations.push(InvariantViolation::Drift {
                        model: model.to_string(),
                        key: key.clone(),
                        field,
                        stored,
                        expected,
                    });
                }
            }
        }
        Ok(OracleResult::from_violations(violations))
    }

    /// No count summary is negative.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be read.
    pub fn check_counts(
        conn: &Connection,
        registry: &Registry,
        model: &str,
    ) -> Result<OracleResult> {
        let Some(key_field) = registry.key_field(model) else {
            return Ok(OracleResult::pass());
        };
        let mut fields: Vec<&str> = registry
            .for_target(model)
            .filter(|config| config.aggregate == Aggregate::Count)
            .map(|config| config.summary_field.as_str())
            .collect();
        fields.sort_unstable();
        fields.dedup();
        if fields.is_empty() {
            return Ok(OracleResult::pass());
        }

        let mut violations = Vec::new();
        for key in all_keys(conn, model, key_field)? {
            let Some(row) = load_row(conn, model, key_field, &key)? else {
                continue;
            };
            for field in &fields {
                let value = row.value(field);
                if value.as_f64().is_some_and(|count| count < 0.0) {
                    violations.push(InvariantViolation::NegativeCount {
                        model: model.to_string(),
                        key: key.clone(),
                        field: (*field).to_string(),
                        value,
                    });
                }
            }
        }
        Ok(OracleResult::from_violations(violations))
    }

    /// The deferred log is fully drained and nothing failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be queried.
    pub fn check_log(conn: &Connection) -> Result<OracleResult> {
        let pending = rollup_core::log::pending_count(conn)?;
        let failed: u64 = conn.query_row(
            "SELECT COUNT(*) FROM rollup_log WHERE failure IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let mut violations = Vec::new();
        if pending > 0 {
            violations.push(InvariantViolation::PendingEntries { count: pending });
        }
        if failed > 0 {
            violations.push(InvariantViolation::FailedEntries { count: failed });
        }
        Ok(OracleResult::from_violations(violations))
    }
}

fn all_keys(conn: &Connection, model: &str, key_field: &str) -> Result<Vec<Key>> {
    let mut keys = Vec::new();
    loop {
        let page = list_keys_after(conn, model, key_field, keys.last(), 128)?;
        if page.is_empty() {
            return Ok(keys);
        }
        keys.extend(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_core::CacheConfig;

    fn setup() -> (Connection, Registry) {
        let mut conn = Connection::open_in_memory().expect("open");
        rollup_core::db::prepare(&mut conn).expect("prepare");
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item_count INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE items (id INTEGER PRIMARY KEY, order_id INTEGER);
             INSERT INTO orders (id) VALUES (1), (2);
             INSERT INTO items (order_id) VALUES (1), (1), (2);",
        )
        .expect("seed");
        let registry = Registry::from_configs([CacheConfig::count(
            "items", "order_id", "orders", "item_count",
        )])
        .expect("registry");
        Engine::new(&conn, &registry)
            .refresh("orders", 10)
            .expect("refresh");
        (conn, registry)
    }

    #[test]
    fn settled_store_passes() {
        let (conn, registry) = setup();
        let result = CacheOracle::check_all(&conn, &registry).expect("check");
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn drift_is_reported_not_repaired() {
        let (conn, registry) = setup();
        conn.execute("UPDATE orders SET item_count = 7 WHERE id = 2", [])
            .expect("corrupt");

        let result = CacheOracle::check_all(&conn, &registry).expect("check");
        assert!(!result.passed);
        assert_eq!(
            result.violations,
            vec![InvariantViolation::Drift {
                model: "orders".to_string(),
                key: Key::Integer(2),
                field: "item_count".to_string(),
                stored: Value::Integer(7),
                expected: Value::Integer(1),
            }]
        );
        let stored: i64 = conn
            .query_row("SELECT item_count FROM orders WHERE id = 2", [], |row| row.get(0))
            .expect("read");
        assert_eq!(stored, 7);
    }

    #[test]
    fn negative_counts_are_reported() {
        let (conn, registry) = setup();
        conn.execute("UPDATE orders SET item_count = -1 WHERE id = 1", [])
            .expect("corrupt");
        let result = CacheOracle::check_counts(&conn, &registry, "orders").expect("check");
        assert!(matches!(
            result.violations.as_slice(),
            [InvariantViolation::NegativeCount { .. }]
        ));
    }

    #[test]
    fn undrained_log_fails_the_log_check() {
        let (conn, _registry) = setup();
        conn.execute(
            "INSERT INTO rollup_log (configuration, mutation, old_snapshot, new_snapshot,
                                     old_relevant, new_relevant, target_keys, created_at_us)
             VALUES ('x', 'updated', '{}', '{}', 1, 1, '[1]', 0)",
            [],
        )
        .expect("enqueue");
        let result = CacheOracle::check_log(&conn).expect("check");
        assert_eq!(
            result.violations,
            vec![InvariantViolation::PendingEntries { count: 1 }]
        );
    }
}
