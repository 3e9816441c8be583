//! Applying planned operations to target rows.
//!
//! Operations are grouped by target row and propagate flag, and each group
//! becomes one `UPDATE` whose `SET` clause covers every summary field the
//! group touches. Sibling operations on the same field merge first: deltas
//! add up, extreme candidates keep the best one, and anything merged with a
//! recompute becomes a recompute.
//!
//! A cell already written earlier in the same event (tracked by the caller's
//! applied set) is not written with a delta twice: the operation escalates
//! to a recompute, which is correct regardless of what ran before.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;

use crate::config::Extreme;
use crate::db::{load_row, quote_ident};
use crate::delta::{Change, OperationKey, UpdateOperation};
use crate::error::Result;
use crate::recompute::{SummaryQuery, summary_expression};
use crate::record::{SourceEvent, SourceRecord};
use crate::registry::Registry;
use crate::value::{Key, Value};

/// What one [`Executor::apply`] call did.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// Operations in application order, with `propagate_value` filled in.
    pub operations: Vec<UpdateOperation>,
    /// Synthetic update events for rows written by propagating groups.
    pub propagations: Vec<SourceEvent>,
    /// `UPDATE` statements issued.
    pub statements: usize,
    /// Operations turned into recomputes because their cell was already
    /// written in this event.
    pub escalated: usize,
    /// Groups whose target row no longer exists.
    pub missing_targets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    target_model: String,
    key_field: String,
    target_key: Key,
    propagate: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct FieldWrite {
    change: Change,
    lazy: bool,
}

impl FieldWrite {
    fn merge(&mut self, change: &Change, lazy: bool) {
        self.lazy |= lazy;
        self.change = match (&self.change, change) {
            (Change::Add(a), Change::Add(b)) => Change::Add(a.numeric_add(b)),
            (
                Change::Candidate { extreme, value: a },
                Change::Candidate { extreme: other, value: b },
            ) if extreme == other => Change::Candidate {
                extreme: *extreme,
                value: better(*extreme, a, b).clone(),
            },
            _ => Change::Recompute,
        };
    }

    fn is_noop(&self) -> bool {
        matches!(&self.change, Change::Add(amount) if amount.is_zero())
    }
}

fn better<'v>(extreme: Extreme, a: &'v Value, b: &'v Value) -> &'v Value {
    match (extreme, a.sql_cmp(b)) {
        (_, None) => {
            if a.is_null() {
                b
            } else {
                a
            }
        }
        (Extreme::Max, Some(ordering)) => {
            if ordering.is_ge() {
                a
            } else {
                b
            }
        }
        (Extreme::Min, Some(ordering)) => {
            if ordering.is_le() {
                a
            } else {
                b
            }
        }
    }
}

/// Writes grouped operations into target tables.
#[derive(Clone, Copy)]
pub struct Executor<'a> {
    conn: &'a Connection,
    registry: &'a Registry,
}

impl<'a> Executor<'a> {
    #[must_use]
    pub const fn new(conn: &'a Connection, registry: &'a Registry) -> Self {
        Self { conn, registry }
    }

    /// Apply one level of operations.
    ///
    /// `applied` carries the cells written so far in the current event and
    /// is extended with every cell written here.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails; the caller's transaction is
    /// left for the caller to roll back.
    pub fn apply(
        &self,
        operations: Vec<UpdateOperation>,
        applied: &mut HashSet<OperationKey>,
    ) -> Result<Applied> {
        let mut outcome = Applied::default();
        let mut order: Vec<GroupKey> = Vec::new();
        let mut groups: HashMap<GroupKey, Vec<UpdateOperation>> = HashMap::new();

        for mut op in operations {
            if applied.contains(&op.key()) && op.change != Change::Recompute {
                tracing::debug!(
                    cell = %op.key(),
                    "cell already written in this event; recomputing instead"
                );
                op.change = Change::Recompute;
                outcome.escalated += 1;
            }
            let group = GroupKey {
                target_model: op.target_model.clone(),
                key_field: op.key_field.clone(),
                target_key: op.target_key.clone(),
                propagate: op.propagate,
            };
            groups
                .entry(group.clone())
                .or_insert_with(|| {
                    order.push(group);
                    Vec::new()
                })
                .push(op);
        }

        for group in order {
            let Some(ops) = groups.remove(&group) else {
                continue;
            };
            self.apply_group(&group, ops, applied, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn apply_group(
        &self,
        group: &GroupKey,
        mut ops: Vec<UpdateOperation>,
        applied: &mut HashSet<OperationKey>,
        outcome: &mut Applied,
    ) -> Result<()> {
        let mut fields: Vec<(String, FieldWrite)> = Vec::new();
        for op in &ops {
            match fields.iter_mut().find(|(name, _)| *name == op.summary_field) {
                Some((_, write)) => write.merge(&op.change, op.lazy),
                None => fields.push((
                    op.summary_field.clone(),
                    FieldWrite {
                        change: op.change.clone(),
                        lazy: op.lazy,
                    },
                )),
            }
        }
        fields.retain(|(_, write)| !write.is_noop());

        if !fields.is_empty() {
            let before = if group.propagate {
                load_row(self.conn, &group.target_model, &group.key_field, &group.target_key)?
            } else {
                None
            };

            let statement = self.update_statement(group, &fields)?;
            let changed = self
                .conn
                .prepare_cached(&statement.sql)?
                .execute(rusqlite::params_from_iter(statement.params))?;
            outcome.statements += 1;

            if changed == 0 {
                outcome.missing_targets += 1;
                tracing::debug!(
                    model = %group.target_model,
                    key = %group.target_key,
                    "target row missing; nothing to update"
                );
            } else if group.propagate
                && let Some(before) = before
                && let Some(after) =
                    load_row(self.conn, &group.target_model, &group.key_field, &group.target_key)?
            {
                for op in &mut ops {
                    op.propagate_value = Some(after.value(&op.summary_field));
                }
                outcome.propagations.push(SourceEvent::updated(
                    SourceRecord::new(group.target_model.clone(), after)
                        .with_key(group.target_key.clone())
                        .with_original(before),
                ));
            }
        }

        for op in ops {
            applied.insert(op.key());
            outcome.operations.push(op);
        }
        Ok(())
    }

    fn update_statement(
        &self,
        group: &GroupKey,
        fields: &[(String, FieldWrite)],
    ) -> Result<SummaryQuery> {
        let mut statement = SummaryQuery {
            sql: format!("UPDATE {} SET ", quote_ident(&group.target_model)),
            params: Vec::new(),
        };

        for (idx, (field, write)) in fields.iter().enumerate() {
            if idx > 0 {
                statement.sql.push_str(", ");
            }
            let column = quote_ident(field);
            statement.sql.push_str(&column);
            statement.sql.push_str(" = ");
            match &write.change {
                Change::Add(amount) => {
                    if write.lazy {
                        statement.sql.push_str(&format!(
                            "CASE WHEN {column} IS NULL THEN NULL ELSE {column} + ? END"
                        ));
                    } else {
                        statement.sql.push_str(&format!("COALESCE({column}, 0) + ?"));
                    }
                    statement.params.push(amount.clone());
                }
                Change::Candidate { extreme, value } => {
                    let beaten = match extreme {
                        Extreme::Max => "<",
                        Extreme::Min => ">",
                    };
                    let lazy_guard = if write.lazy {
                        format!("WHEN {column} IS NULL THEN NULL ")
                    } else {
                        String::new()
                    };
                    statement.sql.push_str(&format!(
                        "CASE {lazy_guard}WHEN {column} IS NULL OR {column} {beaten} ? THEN ? ELSE {column} END"
                    ));
                    statement.params.push(value.clone());
                    statement.params.push(value.clone());
                }
                Change::Recompute => {
                    let expression = summary_expression(
                        self.registry,
                        &group.target_model,
                        field,
                        &group.target_key,
                    )?;
                    statement.sql.push_str(&expression.sql);
                    statement.params.extend(expression.params);
                }
            }
        }

        statement
            .sql
            .push_str(&format!(" WHERE {} = ?", quote_ident(&group.key_field)));
        statement.params.push(group.target_key.clone().into());
        Ok(statement)
    }
}
