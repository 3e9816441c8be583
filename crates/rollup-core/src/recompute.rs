//! Recomputing summaries from scratch.
//!
//! Every summary field has a closed-form SQL definition: the aggregate of
//! its configurations' source rows. That definition is the source of truth
//! the incremental path must agree with. It is used to
//! - resolve operations that cannot be applied as deltas (min/max removals,
//!   custom aggregates, colliding operations)
//! - rebuild one target, refresh a whole model, or detect drift
//!
//! Fan-in fields (several configurations writing one field) combine their
//! per-configuration subqueries: `+` for count and sum, and
//! `max(coalesce(a, b), coalesce(b, a))` (resp. `min`) for extremes so an
//! empty side never wins.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rusqlite::{Connection, OptionalExtension};

use crate::config::{
    Aggregate, CacheConfiguration, Condition, Extreme, ForeignKeyStrategy, Literal, Operator,
};
use crate::db::{self, list_keys_after, load_row, quote_ident};
use crate::error::{CacheError, Result};
use crate::registry::Registry;
use crate::value::{Key, Value};

/// A SQL scalar expression and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SummaryQuery {
    fn append(&mut self, other: &Self) {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params.iter().cloned());
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// `(SELECT agg(...) FROM source WHERE <links to key> AND <conditions>)`
#[must_use]
pub fn configuration_subquery(config: &CacheConfiguration, key: &Key) -> SummaryQuery {
    let source = quote_ident(&config.source_model);
    let column = |field: &str| format!("s.{}", quote_ident(field));
    let value = config.value_field.as_deref().map(column).unwrap_or_default();

    let select = match &config.aggregate {
        Aggregate::Count => "COUNT(*)".to_string(),
        Aggregate::Sum => format!("COALESCE(SUM({value}), 0)"),
        Aggregate::Min => format!("MIN({value})"),
        Aggregate::Max => format!("MAX({value})"),
        Aggregate::Custom(function) => format!("{function}({value})"),
    };

    let mut params: Vec<Value> = Vec::new();
    let key_value = Value::from(key.clone());
    let foreign_key = column(&config.foreign_key_field);
    let mut clauses = vec![match &config.strategy {
        ForeignKeyStrategy::Direct => {
            params.push(key_value);
            format!("{foreign_key} = ?")
        }
        ForeignKeyStrategy::Path { separator } => {
            let sep = Value::Text(separator.clone());
            params.extend([sep.clone(), sep.clone(), sep.clone(), key_value, sep]);
            format!("instr(? || {foreign_key} || ?, ? || CAST(? AS TEXT) || ?) > 0")
        }
        ForeignKeyStrategy::ThroughPivot(pivot) => {
            params.push(key_value);
            let mut link = format!(
                "{foreign_key} IN (SELECT p.{src} FROM {table} AS p WHERE p.{tgt} = ?",
                src = quote_ident(&pivot.source_column),
                table = quote_ident(&pivot.table),
                tgt = quote_ident(&pivot.target_column),
            );
            if let Some(discriminator) = &pivot.discriminator {
                let _ = write!(link, " AND p.{} = ?", quote_ident(&discriminator.column));
                params.push(discriminator.value.clone());
            }
            link.push(')');
            link
        }
    }];

    for condition in &config.conditions {
        clauses.push(condition_sql(condition, &column(&condition.attribute), &mut params));
    }
    if let Some(field) = &config.soft_delete_field {
        clauses.push(format!("{} IS NULL", column(field)));
    }

    SummaryQuery {
        sql: format!(
            "(SELECT {select} FROM {source} AS s WHERE {})",
            clauses.join(" AND ")
        ),
        params,
    }
}

fn condition_sql(condition: &Condition, column: &str, params: &mut Vec<Value>) -> String {
    match (&condition.operator, &condition.literal) {
        (Operator::In, Literal::Many(options)) if options.is_empty() => "0".to_string(),
        (Operator::In, Literal::Many(options)) => {
            params.extend(options.iter().cloned());
            let marks = vec!["?"; options.len()].join(", ");
            format!("{column} IN ({marks})")
        }
        (_, Literal::Many(_)) => "0".to_string(),
        (Operator::Eq, Literal::One(Value::Null)) => format!("{column} IS NULL"),
        (Operator::Ne, Literal::One(Value::Null)) => format!("{column} IS NOT NULL"),
        (_, Literal::One(Value::Null)) => "0".to_string(),
        (operator, Literal::One(literal)) => {
            params.push(literal.clone());
            let symbol = if *operator == Operator::In { "=" } else { operator.as_sql() };
            format!("{column} {symbol} ?")
        }
    }
}

/// The combined expression for one summary field of one target row.
///
/// # Errors
///
/// Returns [`CacheError::UnsupportedAggregation`] if nothing writes the
/// field.
pub fn summary_expression(
    registry: &Registry,
    target_model: &str,
    summary_field: &str,
    key: &Key,
) -> Result<SummaryQuery> {
    let mut writers = registry.writing(target_model, summary_field);
    let Some(first) = writers.next() else {
        return Err(CacheError::unsupported(
            &format!("{target_model}.{summary_field}"),
            "no configuration writes this field",
        ));
    };

    let mut combined = configuration_subquery(first, key);
    for writer in writers {
        let next = configuration_subquery(writer, key);
        combined = match first.aggregate.extreme() {
            None => {
                let mut sum = combined;
                sum.sql.push_str(" + ");
                sum.append(&next);
                sum
            }
            Some(extreme) => {
                let function = match extreme {
                    Extreme::Min => "min",
                    Extreme::Max => "max",
                };
                let mut folded = SummaryQuery {
                    sql: format!("{function}(coalesce("),
                    params: Vec::new(),
                };
                folded.append(&combined);
                folded.sql.push_str(", ");
                folded.append(&next);
                folded.sql.push_str("), coalesce(");
                folded.append(&next);
                folded.sql.push_str(", ");
                folded.append(&combined);
                folded.sql.push_str("))");
                folded
            }
        };
    }
    Ok(combined)
}

// ---------------------------------------------------------------------------
// Reads and rebuilds
// ---------------------------------------------------------------------------

/// Compute every summary field of one target row without writing.
///
/// Fields with no contributing rows come back as the aggregate's identity
/// (0 for count and sum, NULL otherwise).
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn recompute(
    conn: &Connection,
    registry: &Registry,
    target_model: &str,
    key: &Key,
) -> Result<BTreeMap<String, Value>> {
    let fields = registry.summary_fields(target_model);
    recompute_fields(conn, registry, target_model, &fields, key)
}

/// Compute selected summary fields of one target row without writing.
///
/// # Errors
///
/// Returns an error if a field has no writer or the query fails.
pub fn recompute_fields(
    conn: &Connection,
    registry: &Registry,
    target_model: &str,
    fields: &[&str],
    key: &Key,
) -> Result<BTreeMap<String, Value>> {
    if fields.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut select = SummaryQuery {
        sql: "SELECT ".to_string(),
        params: Vec::new(),
    };
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            select.sql.push_str(", ");
        }
        select.append(&summary_expression(registry, target_model, field, key)?);
    }

    let values = conn.query_row(
        &select.sql,
        rusqlite::params_from_iter(select.params),
        |row| {
            (0..fields.len())
                .map(|idx| row.get::<_, Value>(idx))
                .collect::<rusqlite::Result<Vec<_>>>()
        },
    )?;
    Ok(fields
        .iter()
        .map(|f| (*f).to_string())
        .zip(values)
        .collect())
}

/// Recompute and store every summary field of one target row.
///
/// Returns the written values, or `None` when the row does not exist.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn rebuild(
    conn: &Connection,
    registry: &Registry,
    target_model: &str,
    key: &Key,
) -> Result<Option<BTreeMap<String, Value>>> {
    let fields = registry.summary_fields(target_model);
    rebuild_fields(conn, registry, target_model, &fields, key)
}

/// Recompute and store selected summary fields of one target row.
///
/// # Errors
///
/// Returns an error if a field has no writer or the update fails.
pub fn rebuild_fields(
    conn: &Connection,
    registry: &Registry,
    target_model: &str,
    fields: &[&str],
    key: &Key,
) -> Result<Option<BTreeMap<String, Value>>> {
    let Some(key_field) = registry.key_field(target_model) else {
        return Ok(Some(BTreeMap::new()));
    };
    if fields.is_empty() {
        return Ok(Some(BTreeMap::new()));
    }

    let mut update = SummaryQuery {
        sql: format!("UPDATE {} SET ", quote_ident(target_model)),
        params: Vec::new(),
    };
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            update.sql.push_str(", ");
        }
        let _ = write!(update.sql, "{} = ", quote_ident(field));
        update.append(&summary_expression(registry, target_model, field, key)?);
    }
    let returning = fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(
        update.sql,
        " WHERE {} = ? RETURNING {returning}",
        quote_ident(key_field)
    );
    update.params.push(key.clone().into());

    let mut stmt = conn.prepare_cached(&update.sql)?;
    let written = stmt
        .query_row(rusqlite::params_from_iter(update.params), |row| {
            (0..fields.len())
                .map(|idx| row.get::<_, Value>(idx))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .optional()?;

    Ok(written.map(|values| {
        fields
            .iter()
            .map(|f| (*f).to_string())
            .zip(values)
            .collect()
    }))
}

// ---------------------------------------------------------------------------
// Whole-model maintenance
// ---------------------------------------------------------------------------

/// Counters from a whole-model refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub rows: usize,
    pub chunks: usize,
}

/// Rebuild every row of `target_model`, `chunk_size` keys at a time.
///
/// # Errors
///
/// Returns an error if a page query or a rebuild fails.
pub fn refresh(
    conn: &Connection,
    registry: &Registry,
    target_model: &str,
    chunk_size: usize,
) -> Result<RefreshReport> {
    let mut report = RefreshReport::default();
    let Some(key_field) = registry.key_field(target_model) else {
        return Ok(report);
    };
    let fields = registry.summary_fields(target_model);

    let mut cursor: Option<Key> = None;
    loop {
        let page = list_keys_after(
            conn,
            target_model,
            key_field,
            cursor.as_ref(),
            chunk_size.max(1),
        )?;
        if page.is_empty() {
            break;
        }
        for key in &page {
            if rebuild_fields(conn, registry, target_model, &fields, key)?.is_some() {
                report.rows += 1;
            }
        }
        report.chunks += 1;
        tracing::debug!(
            model = target_model,
            chunk = report.chunks,
            rows = report.rows,
            "refreshed chunk"
        );
        cursor = page.into_iter().last();
    }

    conn.execute(
        "UPDATE rollup_meta SET last_refresh_at_us = ?1 WHERE id = 1",
        [db::now_us()],
    )?;
    tracing::info!(
        model = target_model,
        rows = report.rows,
        chunks = report.chunks,
        "refresh complete"
    );
    Ok(report)
}

/// One stored summary that disagreed with its recomputed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub key: Key,
    pub field: String,
    pub stored: Value,
    pub expected: Value,
}

/// Result of comparing stored summaries against recomputed ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
    pub rows_checked: usize,
    pub drifts: Vec<Drift>,
}

impl DriftReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drifts.is_empty()
    }
}

/// Compare every row of `target_model` against a full recompute and repair
/// the rows that drifted.
///
/// # Errors
///
/// Returns an error if a query or a repair fails.
pub fn recalculate(
    conn: &Connection,
    registry: &Registry,
    target_model: &str,
    chunk_size: usize,
) -> Result<DriftReport> {
    let mut report = DriftReport::default();
    let Some(key_field) = registry.key_field(target_model) else {
        return Ok(report);
    };
    let fields = registry.summary_fields(target_model);

    let mut cursor: Option<Key> = None;
    loop {
        let page = list_keys_after(
            conn,
            target_model,
            key_field,
            cursor.as_ref(),
            chunk_size.max(1),
        )?;
        if page.is_empty() {
            break;
        }
        for key in &page {
            let Some(row) = load_row(conn, target_model, key_field, key)? else {
                continue;
            };
            report.rows_checked += 1;
            let expected = recompute_fields(conn, registry, target_model, &fields, key)?;
            let mut drifted: Vec<&str> = Vec::new();
            for field in fields.iter().copied() {
                let stored = row.value(field);
                let wanted = expected.get(field).cloned().unwrap_or_default();
                if !values_match(&stored, &wanted) {
                    drifted.push(field);
                    report.drifts.push(Drift {
                        key: key.clone(),
                        field: field.to_string(),
                        stored,
                        expected: wanted,
                    });
                }
            }
            if !drifted.is_empty() {
                tracing::warn!(
                    model = target_model,
                    key = %key,
                    fields = ?drifted,
                    "summary drift repaired"
                );
                rebuild_fields(conn, registry, target_model, &drifted, key)?;
            }
        }
        cursor = page.into_iter().last();
    }
    Ok(report)
}

/// Equality tolerant of float accumulation error.
#[must_use]
pub fn values_match(stored: &Value, expected: &Value) -> bool {
    match (stored, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Real(_), _) | (_, Value::Real(_)) => match (stored.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0),
            _ => false,
        },
        _ => stored.sql_eq(expected) == Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn seeded() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item_count INTEGER, item_total INTEGER,
                                  max_total INTEGER, skus TEXT);
             CREATE TABLE items (id INTEGER PRIMARY KEY, order_id INTEGER, total INTEGER,
                                 status TEXT, sku TEXT, deleted_at INTEGER);
             INSERT INTO orders (id) VALUES (1), (2);
             INSERT INTO items VALUES (1, 1, 10, 'paid', 'a', NULL),
                                      (2, 1, 5, 'draft', 'b', NULL),
                                      (3, 1, 7, 'paid', 'c', 100),
                                      (4, 2, 3, 'paid', 'd', NULL);",
        )
        .expect("seed");
        crate::db::migrations::migrate(&mut conn).expect("engine tables");
        conn
    }

    fn registry() -> Registry {
        Registry::builder()
            .register(
                CacheConfig::count("items", "order_id", "orders", "item_count")
                    .soft_delete("deleted_at"),
            )
            .register(
                CacheConfig::sum("items", "total", "order_id", "orders", "item_total")
                    .condition("status", "=", "paid"),
            )
            .register(CacheConfig::max("items", "total", "order_id", "orders", "max_total"))
            .register(CacheConfig::custom(
                "group_concat",
                "items",
                "sku",
                "order_id",
                "orders",
                "skus",
            ))
            .build()
            .expect("registry")
    }

    #[test]
    fn recompute_applies_conditions_and_soft_delete() {
        let conn = seeded();
        let values = recompute(&conn, &registry(), "orders", &Key::Integer(1)).expect("recompute");
        assert_eq!(values["item_count"], Value::Integer(2));
        assert_eq!(values["item_total"], Value::Integer(17));
        assert_eq!(values["max_total"], Value::Integer(10));
        assert!(matches!(values["skus"], Value::Text(_)));
    }

    #[test]
    fn recompute_of_empty_target_yields_identities() {
        let conn = seeded();
        let values = recompute(&conn, &registry(), "orders", &Key::Integer(9)).expect("recompute");
        assert_eq!(values["item_count"], Value::Integer(0));
        assert_eq!(values["item_total"], Value::Integer(0));
        assert_eq!(values["max_total"], Value::Null);
    }

    #[test]
    fn rebuild_writes_and_reports_missing_rows() {
        let conn = seeded();
        let registry = registry();
        let written = rebuild(&conn, &registry, "orders", &Key::Integer(2))
            .expect("rebuild")
            .expect("row exists");
        assert_eq!(written["item_count"], Value::Integer(1));

        let stored: i64 = conn
            .query_row("SELECT item_total FROM orders WHERE id = 2", [], |row| row.get(0))
            .expect("read");
        assert_eq!(stored, 3);

        assert!(rebuild(&conn, &registry, "orders", &Key::Integer(9))
            .expect("rebuild")
            .is_none());
    }

    #[test]
    fn fan_in_extremes_ignore_empty_sides() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, latest INTEGER);
             CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER, at INTEGER);
             CREATE TABLE likes (id INTEGER PRIMARY KEY, post_id INTEGER, at INTEGER);
             INSERT INTO posts (id) VALUES (1), (2), (3);
             INSERT INTO comments VALUES (1, 1, 50), (2, 2, 20);
             INSERT INTO likes VALUES (1, 1, 40), (2, 3, 90);",
        )
        .expect("seed");
        let registry = Registry::builder()
            .register(CacheConfig::max("comments", "at", "post_id", "posts", "latest"))
            .register(CacheConfig::max("likes", "at", "post_id", "posts", "latest"))
            .build()
            .expect("registry");

        let latest = |id: i64| {
            recompute(&conn, &registry, "posts", &Key::Integer(id)).expect("recompute")["latest"]
                .clone()
        };
        assert_eq!(latest(1), Value::Integer(50));
        assert_eq!(latest(2), Value::Integer(20));
        assert_eq!(latest(3), Value::Integer(90));
    }

    #[test]
    fn path_strategy_matches_whole_segments() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE categories (id INTEGER PRIMARY KEY, product_count INTEGER);
             CREATE TABLE products (id INTEGER PRIMARY KEY, path TEXT);
             INSERT INTO categories (id) VALUES (1), (2), (12);
             INSERT INTO products VALUES (1, '1/12'), (2, '1/2'), (3, '12');",
        )
        .expect("seed");
        let registry = Registry::builder()
            .register(
                CacheConfig::count("products", "path", "categories", "product_count").path("/"),
            )
            .build()
            .expect("registry");

        let count = |id: i64| {
            recompute(&conn, &registry, "categories", &Key::Integer(id)).expect("recompute")
                ["product_count"]
                .clone()
        };
        assert_eq!(count(1), Value::Integer(2));
        assert_eq!(count(2), Value::Integer(1));
        assert_eq!(count(12), Value::Integer(2));
    }

    #[test]
    fn recalculate_reports_and_repairs_drift() {
        let conn = seeded();
        let registry = registry();
        refresh(&conn, &registry, "orders", 1).expect("refresh");
        conn.execute("UPDATE orders SET item_count = 99 WHERE id = 1", [])
            .expect("corrupt");

        let report = recalculate(&conn, &registry, "orders", 10).expect("recalculate");
        assert_eq!(report.rows_checked, 2);
        assert_eq!(report.drifts.len(), 1);
        assert_eq!(report.drifts[0].field, "item_count");
        assert_eq!(report.drifts[0].stored, Value::Integer(99));

        let clean = recalculate(&conn, &registry, "orders", 10).expect("recalculate");
        assert!(clean.is_clean());
    }

    #[test]
    fn values_match_tolerates_float_noise() {
        assert!(values_match(&Value::Real(0.1 + 0.2), &Value::Real(0.3)));
        assert!(values_match(&Value::Integer(3), &Value::Real(3.0)));
        assert!(!values_match(&Value::Null, &Value::Integer(0)));
    }
}
