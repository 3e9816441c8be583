//! Event pipeline façade.
//!
//! [`Engine::handle`] is the one entry point hosts call for every source
//! mutation, inside the transaction that performs the mutation. For each
//! configuration sourced from the mutated model it:
//!
//! 1. skips `manual` configurations (maintained by rebuild/refresh only)
//! 2. appends `asynchronous` ones to the deferred log
//! 3. plans the rest and applies them level by level
//!
//! Propagation is breadth first: every row written by a propagating group
//! becomes a synthetic update event, and the events of one level are
//! planned together into the next level. The registry's longest chain
//! bounds the number of levels.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rusqlite::Connection;

use crate::db::{self, with_immediate_transaction};
use crate::delta::{DeltaEngine, UpdateOperation};
use crate::error::{CacheError, Result};
use crate::executor::Executor;
use crate::log::{self, DrainOptions, DrainReport, LogEntry};
use crate::recompute::{self, DriftReport, RefreshReport};
use crate::record::SourceEvent;
use crate::registry::Registry;
use crate::resolve::{KeyResolver, KeySetCache, SqlKeySetProvider};
use crate::value::{Key, Value};

/// Counters for one handled event (including its propagation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventReport {
    /// Operations applied across all levels.
    pub operations: usize,
    /// `UPDATE` statements issued.
    pub statements: usize,
    /// Propagation levels executed.
    pub levels: usize,
    /// Operations escalated to recomputes because their cell was written
    /// earlier in the same event.
    pub escalated: usize,
    /// Deferred log entries appended.
    pub enqueued: usize,
}

impl EventReport {
    fn absorb(&mut self, other: &Self) {
        self.operations += other.operations;
        self.statements += other.statements;
        self.levels = self.levels.max(other.levels);
        self.escalated += other.escalated;
        self.enqueued += other.enqueued;
    }
}

/// Counters for [`Engine::handle_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    pub totals: EventReport,
}

enum EntryOutcome {
    Applied,
    Canceled,
}

/// Cache maintenance over one connection and one registry.
#[derive(Clone, Copy)]
pub struct Engine<'a> {
    conn: &'a Connection,
    registry: &'a Registry,
}

impl<'a> Engine<'a> {
    #[must_use]
    pub const fn new(conn: &'a Connection, registry: &'a Registry) -> Self {
        Self { conn, registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &'a Registry {
        self.registry
    }

    // -----------------------------------------------------------------------
    // Event path
    // -----------------------------------------------------------------------

    /// Maintain every aggregate affected by one source mutation.
    ///
    /// Runs inside whatever transaction the caller holds; on error nothing
    /// is rolled back here.
    ///
    /// # Errors
    ///
    /// Returns configuration-shaped errors for malformed events
    /// (missing attributes, orphaned rows) and storage errors as-is.
    pub fn handle(&self, event: &SourceEvent) -> Result<EventReport> {
        let sql = SqlKeySetProvider::new(self.conn);
        let cache = KeySetCache::new(&sql);
        let delta = DeltaEngine::new(KeyResolver::new(&cache));

        let mut report = EventReport::default();
        let operations = self.dispatch(&delta, event, &mut report)?;
        self.run(&delta, operations, &mut report)?;

        tracing::debug!(
            model = %event.record.model,
            mutation = %event.mutation,
            operations = report.operations,
            statements = report.statements,
            levels = report.levels,
            enqueued = report.enqueued,
            "event handled"
        );
        Ok(report)
    }

    /// Handle a batch of events in one `BEGIN IMMEDIATE` transaction.
    ///
    /// All-or-nothing: the first failing event rolls back the whole batch.
    ///
    /// # Errors
    ///
    /// Returns the first event's error, or a storage error if the
    /// transaction cannot be opened or committed.
    pub fn handle_batch(&self, events: &[SourceEvent]) -> Result<BatchReport> {
        with_immediate_transaction(self.conn, |_| {
            let mut batch = BatchReport::default();
            for event in events {
                let report = self.handle(event)?;
                batch.events += 1;
                batch.totals.absorb(&report);
            }
            Ok(batch)
        })
    }

    /// Plan one event against the configurations sourced from its model,
    /// enqueueing asynchronous ones.
    fn dispatch(
        &self,
        delta: &DeltaEngine<'_>,
        event: &SourceEvent,
        report: &mut EventReport,
    ) -> Result<Vec<UpdateOperation>> {
        let mut operations = Vec::new();
        for config in self.registry.for_source(&event.record.model) {
            if config.flags.manual {
                continue;
            }
            if config.flags.asynchronous {
                let class = delta.classify(config, event)?;
                let planned = delta.plan(config, event)?;
                if planned.is_empty() {
                    continue;
                }
                let mut targets: BTreeSet<Key> = class.affected_keys().into_iter().collect();
                targets.extend(planned.into_iter().map(|op| op.target_key));
                let targets: Vec<Key> = targets.into_iter().collect();
                log::enqueue(
                    self.conn,
                    config,
                    event,
                    (class.transition.was(), class.transition.is()),
                    &targets,
                )?;
                report.enqueued += 1;
                continue;
            }
            operations.extend(delta.plan(config, event)?);
        }
        Ok(operations)
    }

    /// Apply operations level by level until nothing propagates.
    fn run(
        &self,
        delta: &DeltaEngine<'_>,
        operations: Vec<UpdateOperation>,
        report: &mut EventReport,
    ) -> Result<()> {
        let executor = Executor::new(self.conn, self.registry);
        let max_depth = self.registry.max_chain_depth();
        let mut applied = HashSet::new();
        let mut level = operations;
        let mut depth = 0;

        while !level.is_empty() {
            depth += 1;
            if depth > max_depth {
                return Err(CacheError::PropagationDepthExceeded { depth: max_depth });
            }

            let outcome = executor.apply(level, &mut applied)?;
            report.operations += outcome.operations.len();
            report.statements += outcome.statements;
            report.escalated += outcome.escalated;
            report.levels = depth;

            let mut next = Vec::new();
            for event in &outcome.propagations {
                next.extend(self.dispatch(delta, event, report)?);
            }
            level = next;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deferred path
    // -----------------------------------------------------------------------

    /// Process pending log entries in creation order.
    ///
    /// Each entry runs in its own `BEGIN IMMEDIATE` transaction. Busy
    /// storage stops the cycle and leaves the entry pending; any other
    /// error marks the entry failed and moves on.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending entries cannot be read or a
    /// failure cannot be recorded.
    pub fn drain_pending(&self, options: &DrainOptions) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let entries = log::pending(self.conn, options.batch_size)?;

        for entry in &entries {
            if options.expired() {
                tracing::debug!(
                    remaining = entries.len() - report.handled(),
                    "drain deadline reached"
                );
                break;
            }
            match with_immediate_transaction(self.conn, |_| self.process_entry(entry)) {
                Ok(EntryOutcome::Applied) => report.applied += 1,
                Ok(EntryOutcome::Canceled) => report.canceled += 1,
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        entry_id = entry.id,
                        error = %err,
                        "storage busy; leaving entry for the next drain"
                    );
                    report.deferred += 1;
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        entry_id = entry.id,
                        configuration = %entry.configuration,
                        code = %err.code(),
                        error = %err,
                        "deferred operation failed"
                    );
                    let reason = format!("{}: {err}", err.code());
                    with_immediate_transaction(self.conn, |conn| {
                        log::mark_failed(conn, entry.id, &reason)
                    })?;
                    report.failed += 1;
                }
            }
        }

        // A busy store would refuse this write too.
        if report.deferred == 0 {
            self.conn.execute(
                "UPDATE rollup_meta SET last_drain_at_us = ?1 WHERE id = 1",
                [db::now_us()],
            )?;
        }
        if report.handled() > 0 || report.deferred > 0 {
            tracing::info!(
                applied = report.applied,
                canceled = report.canceled,
                failed = report.failed,
                deferred = report.deferred,
                "drain cycle complete"
            );
        }
        Ok(report)
    }

    fn process_entry(&self, entry: &LogEntry) -> Result<EntryOutcome> {
        let Some(config) = self.registry.by_name(&entry.configuration) else {
            return Err(CacheError::invalid_relation(
                &entry.configuration,
                "no such configuration is registered",
            ));
        };

        if log::is_superseded(self.conn, entry)? {
            log::mark_canceled(self.conn, entry.id)?;
            tracing::debug!(entry_id = entry.id, "deferred operation superseded");
            return Ok(EntryOutcome::Canceled);
        }

        let sql = SqlKeySetProvider::new(self.conn);
        let cache = KeySetCache::new(&sql);
        let delta = DeltaEngine::new(KeyResolver::new(&cache));

        let class = delta.classify(config, &entry.event(&config.source_model))?;
        let mut targets: BTreeSet<Key> = entry.target_keys.iter().cloned().collect();
        targets.extend(class.affected_keys());

        let operations = targets
            .into_iter()
            .map(|key| UpdateOperation::recompute(config, key))
            .collect();
        let mut report = EventReport::default();
        self.run(&delta, operations, &mut report)?;
        log::mark_processed(self.conn, entry.id)?;
        Ok(EntryOutcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Recompute path
    // -----------------------------------------------------------------------

    /// Every summary field of one target row, computed from scratch.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recompute(&self, target_model: &str, key: &Key) -> Result<BTreeMap<String, Value>> {
        recompute::recompute(self.conn, self.registry, target_model, key)
    }

    /// Recompute and store every summary field of one target row.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn rebuild(
        &self,
        target_model: &str,
        key: &Key,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        recompute::rebuild(self.conn, self.registry, target_model, key)
    }

    /// Rebuild every row of a target model.
    ///
    /// # Errors
    ///
    /// Returns an error if a rebuild fails.
    pub fn refresh(&self, target_model: &str, chunk_size: usize) -> Result<RefreshReport> {
        recompute::refresh(self.conn, self.registry, target_model, chunk_size)
    }

    /// Find and repair drifted summaries of a target model.
    ///
    /// # Errors
    ///
    /// Returns an error if a query or repair fails.
    pub fn recalculate(&self, target_model: &str, chunk_size: usize) -> Result<DriftReport> {
        recompute::recalculate(self.conn, self.registry, target_model, chunk_size)
    }

    /// Read one summary, populating it first if it is lazy and still NULL.
    ///
    /// Returns `None` when the target row does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or the population fails.
    pub fn read_summary(
        &self,
        target_model: &str,
        key: &Key,
        summary_field: &str,
    ) -> Result<Option<Value>> {
        let Some(key_field) = self.registry.key_field(target_model) else {
            return Err(CacheError::unsupported(
                &format!("{target_model}.{summary_field}"),
                "no configuration writes this model",
            ));
        };
        let Some(row) = db::load_row(self.conn, target_model, key_field, key)? else {
            return Ok(None);
        };
        let stored = row.value(summary_field);
        let lazy = self
            .registry
            .writing(target_model, summary_field)
            .any(|c| c.flags.lazy);
        if !(lazy && stored.is_null()) {
            return Ok(Some(stored));
        }

        let written = recompute::rebuild_fields(
            self.conn,
            self.registry,
            target_model,
            &[summary_field],
            key,
        )?;
        Ok(written.and_then(|mut values| values.remove(summary_field)))
    }
}
