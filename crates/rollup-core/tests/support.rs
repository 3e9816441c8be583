//! In-memory host used by the integration tests.
//!
//! Plays the role of an application: it mutates its own tables and reports
//! each mutation to the engine with the snapshots it loaded around it.
#![allow(dead_code)]

use rollup_core::db::{self, load_row, quote_ident};
use rollup_core::engine::EventReport;
use rollup_core::{Engine, Key, Registry, Result, Snapshot, SourceEvent, SourceRecord, Value};
use rusqlite::Connection;

pub struct Host {
    pub conn: Connection,
    pub registry: Registry,
}

impl Host {
    pub fn new(schema: &str, registry: Registry) -> Self {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        db::prepare(&mut conn).expect("prepare engine tables");
        conn.execute_batch(schema).expect("create host schema");
        Self { conn, registry }
    }

    pub fn engine(&self) -> Engine<'_> {
        Engine::new(&self.conn, &self.registry)
    }

    /// Insert a row and report the creation; returns the new row id.
    pub fn insert(&self, table: &str, row: &[(&str, Value)]) -> Result<i64> {
        let columns = row
            .iter()
            .map(|(column, _)| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let marks = vec!["?"; row.len()].join(", ");
        self.conn.execute(
            &format!("INSERT INTO {} ({columns}) VALUES ({marks})", quote_ident(table)),
            rusqlite::params_from_iter(row.iter().map(|(_, value)| value.clone())),
        )?;
        let id = self.conn.last_insert_rowid();
        let current = self.load(table, id);
        self.engine()
            .handle(&SourceEvent::created(SourceRecord::new(table, current).with_key(id)))?;
        Ok(id)
    }

    /// Update columns of one row and report the change.
    pub fn update(&self, table: &str, id: i64, changes: &[(&str, Value)]) -> Result<EventReport> {
        let before = self.load(table, id);
        let assignments = changes
            .iter()
            .map(|(column, _)| format!("{} = ?", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params: Vec<Value> = changes.iter().map(|(_, value)| value.clone()).collect();
        params.push(Value::Integer(id));
        self.conn.execute(
            &format!("UPDATE {} SET {assignments} WHERE id = ?", quote_ident(table)),
            rusqlite::params_from_iter(params),
        )?;
        let after = self.load(table, id);
        self.engine().handle(&SourceEvent::updated(
            SourceRecord::new(table, after)
                .with_key(id)
                .with_original(before),
        ))
    }

    /// Hard-delete one row and report the deletion.
    pub fn delete(&self, table: &str, id: i64) -> Result<EventReport> {
        let row = self.load(table, id);
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)),
            [id],
        )?;
        self.engine()
            .handle(&SourceEvent::deleted(SourceRecord::new(table, row).with_key(id)))
    }

    /// Soft-delete one row (`deleted_at` set) and report the deletion.
    pub fn trash(&self, table: &str, id: i64, at: i64) -> Result<EventReport> {
        self.conn.execute(
            &format!("UPDATE {} SET deleted_at = ?1 WHERE id = ?2", quote_ident(table)),
            [at, id],
        )?;
        let row = self.load(table, id);
        let before = Snapshot::new().with("deleted_at", Value::Null);
        self.engine().handle(&SourceEvent::deleted(
            SourceRecord::new(table, row).with_original(before).with_key(id),
        ))
    }

    /// Clear `deleted_at` and report the restore.
    pub fn restore(&self, table: &str, id: i64) -> Result<EventReport> {
        self.conn.execute(
            &format!("UPDATE {} SET deleted_at = NULL WHERE id = ?1", quote_ident(table)),
            [id],
        )?;
        let row = self.load(table, id);
        self.engine()
            .handle(&SourceEvent::restored(SourceRecord::new(table, row).with_key(id)))
    }

    pub fn load(&self, table: &str, id: i64) -> Snapshot {
        load_row(&self.conn, table, "id", &Key::Integer(id))
            .expect("load row")
            .expect("row exists")
    }

    pub fn value(&self, table: &str, id: i64, column: &str) -> Value {
        self.load(table, id).value(column)
    }

    /// Assert every summary of `model` equals a full recompute.
    pub fn assert_consistent(&self, model: &str) {
        let report = self
            .engine()
            .recalculate(model, 64)
            .expect("recalculate");
        assert!(
            report.is_clean(),
            "{model} drifted from recompute: {:?}",
            report.drifts
        );
    }
}

pub fn int(value: i64) -> Value {
    Value::Integer(value)
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}
