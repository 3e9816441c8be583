//! The simulated host application.
//!
//! A small shop: customers own orders, orders hold items, items sit in a
//! category path. Every mutation runs in its own `BEGIN IMMEDIATE`
//! transaction together with the engine call that maintains the caches.

use anyhow::{Context, Result};
use rollup_core::db::{self, load_row, quote_ident, with_immediate_transaction};
use rollup_core::engine::EventReport;
use rollup_core::{CacheConfig, Engine, Key, Registry, Snapshot, SourceEvent, SourceRecord, Value};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Models carrying summary fields.
pub const TARGET_MODELS: [&str; 3] = ["orders", "customers", "categories"];

const SCHEMA: &str = "
    CREATE TABLE customers (
        id INTEGER PRIMARY KEY,
        revenue INTEGER NOT NULL DEFAULT 0,
        order_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE orders (
        id INTEGER PRIMARY KEY,
        customer_id INTEGER,
        item_count INTEGER NOT NULL DEFAULT 0,
        paid_total INTEGER NOT NULL DEFAULT 0,
        largest INTEGER,
        smallest INTEGER,
        gross REAL,
        settled_total INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE categories (
        id INTEGER PRIMARY KEY,
        product_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE items (
        id INTEGER PRIMARY KEY,
        order_id INTEGER,
        total INTEGER NOT NULL,
        status TEXT NOT NULL,
        category_path TEXT NOT NULL,
        deleted_at INTEGER
    );
";

/// Aggregates the simulated shop declares.
///
/// # Errors
///
/// Returns an error if the declarations fail registry validation.
pub fn registry() -> Result<Registry> {
    Registry::from_configs([
        CacheConfig::count("items", "order_id", "orders", "item_count")
            .soft_delete("deleted_at")
            .ignore_empty_foreign_keys(),
        CacheConfig::sum("items", "total", "order_id", "orders", "paid_total")
            .named("paid_total")
            .condition("status", "=", "paid")
            .soft_delete("deleted_at")
            .ignore_empty_foreign_keys()
            .propagate(),
        CacheConfig::max("items", "total", "order_id", "orders", "largest")
            .soft_delete("deleted_at")
            .ignore_empty_foreign_keys(),
        CacheConfig::min("items", "total", "order_id", "orders", "smallest")
            .soft_delete("deleted_at")
            .ignore_empty_foreign_keys(),
        CacheConfig::custom("total", "items", "total", "order_id", "orders", "gross")
            .soft_delete("deleted_at")
            .ignore_empty_foreign_keys(),
        CacheConfig::sum("items", "total", "order_id", "orders", "settled_total")
            .named("settled_total")
            .soft_delete("deleted_at")
            .ignore_empty_foreign_keys()
            .asynchronous(),
        CacheConfig::count("items", "category_path", "categories", "product_count")
            .path("/")
            .soft_delete("deleted_at"),
        CacheConfig::sum("orders", "paid_total", "customer_id", "customers", "revenue"),
        CacheConfig::count("orders", "customer_id", "customers", "order_count"),
    ])
    .context("invalid simulation aggregates")
}

/// Dimensions of the seeded host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub customers: i64,
    pub orders: i64,
    pub categories: i64,
}

/// One host mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Insert {
        order: Option<i64>,
        total: i64,
        paid: bool,
        path: String,
    },
    SetTotal { item: i64, total: i64 },
    Move { item: i64, order: Option<i64> },
    SetStatus { item: i64, paid: bool },
    Recategorize { item: i64, path: String },
    Trash { item: i64 },
    Restore { item: i64 },
    Delete { item: i64 },
    Reassign { order: i64, customer: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveItem {
    id: i64,
    trashed: bool,
}

/// Host database plus the workload's view of which items exist.
pub struct Host {
    conn: Connection,
    registry: Registry,
    shape: Shape,
    items: Vec<LiveItem>,
}

impl Host {
    /// Create the schema, seed customers, orders and categories, then
    /// populate every summary with a refresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be prepared or seeded.
    pub fn open(shape: Shape) -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open simulation store")?;
        db::prepare(&mut conn).context("prepare simulation store")?;
        conn.execute_batch(SCHEMA).context("create host schema")?;

        for id in 1..=shape.customers {
            conn.execute("INSERT INTO customers (id) VALUES (?1)", [id])?;
        }
        for id in 1..=shape.orders {
            let customer = (id - 1) % shape.customers.max(1) + 1;
            conn.execute(
                "INSERT INTO orders (id, customer_id) VALUES (?1, ?2)",
                [id, customer],
            )?;
        }
        for id in 1..=shape.categories {
            conn.execute("INSERT INTO categories (id) VALUES (?1)", [id])?;
        }

        let registry = registry()?;
        let engine = Engine::new(&conn, &registry);
        for model in TARGET_MODELS {
            engine
                .refresh(model, 64)
                .with_context(|| format!("initial refresh of {model}"))?;
        }

        Ok(Self {
            conn,
            registry,
            shape,
            items: Vec::new(),
        })
    }

    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> Engine<'_> {
        Engine::new(&self.conn, &self.registry)
    }

    /// Draw the next mutation. Only mutations a real application could
    /// perform on the current rows are drawn.
    pub fn next_action(&self, rng: &mut DeterministicRng) -> Action {
        let live: Vec<i64> = self.items.iter().filter(|i| !i.trashed).map(|i| i.id).collect();
        let trashed: Vec<i64> = self.items.iter().filter(|i| i.trashed).map(|i| i.id).collect();
        let all: Vec<i64> = self.items.iter().map(|i| i.id).collect();
        let pick = |rng: &mut DeterministicRng, ids: &[i64]| rng.index(ids.len()).map(|i| ids[i]);

        let roll = rng.below(100);
        let action = match roll {
            0..=29 => None,
            30..=44 => pick(rng, &live).map(|item| Action::SetTotal {
                item,
                total: rng.between(-20, 80),
            }),
            45..=56 => pick(rng, &live).map(|item| Action::Move {
                item,
                order: self.order(rng),
            }),
            57..=66 => pick(rng, &live).map(|item| Action::SetStatus {
                item,
                paid: rng.chance(60),
            }),
            67..=73 => pick(rng, &live).map(|item| Action::Recategorize {
                item,
                path: self.path(rng),
            }),
            74..=80 => pick(rng, &live).map(|item| Action::Trash { item }),
            81..=86 => pick(rng, &trashed).map(|item| Action::Restore { item }),
            87..=93 => pick(rng, &all).map(|item| Action::Delete { item }),
            _ => Some(Action::Reassign {
                order: rng.between(1, self.shape.orders),
                customer: rng.between(1, self.shape.customers),
            }),
        };
        action.unwrap_or_else(|| Action::Insert {
            order: self.order(rng),
            total: rng.between(-20, 80),
            paid: rng.chance(50),
            path: self.path(rng),
        })
    }

    /// Some order, occasionally one that does not exist or none at all.
    fn order(&self, rng: &mut DeterministicRng) -> Option<i64> {
        if rng.chance(5) {
            return None;
        }
        Some(rng.between(1, self.shape.orders + 1))
    }

    fn path(&self, rng: &mut DeterministicRng) -> String {
        let depth = rng.between(1, 3);
        (0..depth)
            .map(|_| rng.between(1, self.shape.categories).to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Perform one mutation and report it, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation or its cache maintenance fails; the
    /// transaction is rolled back and the host is unchanged.
    pub fn apply(&mut self, action: &Action, step: u64) -> Result<EventReport> {
        let engine = Engine::new(&self.conn, &self.registry);
        let (report, inserted) = with_immediate_transaction(&self.conn, |conn| {
            let report = match action {
                Action::Insert {
                    order,
                    total,
                    paid,
                    path,
                } => {
                    conn.execute(
                        "INSERT INTO items (order_id, total, status, category_path) VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![order, total, status(*paid), path],
                    )?;
                    let id = conn.last_insert_rowid();
                    let row = fetch(conn, "items", id)?;
                    let report = engine.handle(&SourceEvent::created(
                        SourceRecord::new("items", row).with_key(id),
                    ))?;
                    return Ok((report, Some(id)));
                }
                Action::SetTotal { item, total } => {
                    update(&engine, conn, "items", *item, &[("total", Value::Integer(*total))])
                }
                Action::Move { item, order } => {
                    update(&engine, conn, "items", *item, &[("order_id", Value::from(*order))])
                }
                Action::SetStatus { item, paid } => {
                    update(&engine, conn, "items", *item, &[("status", Value::from(status(*paid)))])
                }
                Action::Recategorize { item, path } => update(
                    &engine,
                    conn,
                    "items",
                    *item,
                    &[("category_path", Value::from(path.as_str()))],
                ),
                Action::Trash { item } => {
                    conn.execute(
                        "UPDATE items SET deleted_at = ?1 WHERE id = ?2",
                        rusqlite::params![i64::try_from(step).unwrap_or(i64::MAX), item],
                    )?;
                    let row = fetch(conn, "items", *item)?;
                    let before = Snapshot::new().with("deleted_at", Value::Null);
                    engine.handle(&SourceEvent::deleted(
                        SourceRecord::new("items", row).with_original(before).with_key(*item),
                    ))
                }
                Action::Restore { item } => {
                    conn.execute("UPDATE items SET deleted_at = NULL WHERE id = ?1", [item])?;
                    let row = fetch(conn, "items", *item)?;
                    engine.handle(&SourceEvent::restored(
                        SourceRecord::new("items", row).with_key(*item),
                    ))
                }
                Action::Delete { item } => {
                    let row = fetch(conn, "items", *item)?;
                    conn.execute("DELETE FROM items WHERE id = ?1", [item])?;
                    engine.handle(&SourceEvent::deleted(
                        SourceRecord::new("items", row).with_key(*item),
                    ))
                }
                Action::Reassign { order, customer } => update(
                    &engine,
                    conn,
                    "orders",
                    *order,
                    &[("customer_id", Value::Integer(*customer))],
                ),
            }?;
            Ok((report, None))
        })
        .with_context(|| format!("step {step}: {action:?}"))?;

        if let Some(id) = inserted {
            self.items.push(LiveItem { id, trashed: false });
        }
        self.track(action);
        Ok(report)
    }

    /// Most recently inserted item still present.
    #[must_use]
    pub fn last_item(&self) -> Option<i64> {
        self.items.last().map(|item| item.id)
    }

    fn track(&mut self, action: &Action) {
        match action {
            Action::Trash { item } | Action::Restore { item } => {
                let trashed = matches!(action, Action::Trash { .. });
                if let Some(live) = self.items.iter_mut().find(|i| i.id == *item) {
                    live.trashed = trashed;
                }
            }
            Action::Delete { item } => self.items.retain(|i| i.id != *item),
            Action::Insert { .. }
            | Action::SetTotal { .. }
            | Action::Move { .. }
            | Action::SetStatus { .. }
            | Action::Recategorize { .. }
            | Action::Reassign { .. } => {}
        }
    }
}

fn status(paid: bool) -> &'static str {
    if paid { "paid" } else { "open" }
}

fn fetch(conn: &Connection, table: &str, id: i64) -> rollup_core::Result<Snapshot> {
    load_row(conn, table, "id", &Key::Integer(id))?
        .ok_or(rusqlite::Error::QueryReturnedNoRows)
        .map_err(Into::into)
}

fn update(
    engine: &Engine<'_>,
    conn: &Connection,
    table: &str,
    id: i64,
    changes: &[(&str, Value)],
) -> rollup_core::Result<EventReport> {
    let before = fetch(conn, table, id)?;
    let assignments = changes
        .iter()
        .map(|(column, _)| format!("{} = ?", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let params = changes
        .iter()
        .map(|(_, value)| value.clone())
        .chain(std::iter::once(Value::Integer(id)));
    conn.execute(
        &format!("UPDATE {} SET {assignments} WHERE id = ?", quote_ident(table)),
        rusqlite::params_from_iter(params),
    )?;
    let after = fetch(conn, table, id)?;
    engine.handle(&SourceEvent::updated(
        SourceRecord::new(table, after)
            .with_key(id)
            .with_original(before),
    ))
}
