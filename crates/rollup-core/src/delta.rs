//! Translating one source mutation into summary updates.
//!
//! For each configuration the planner asks two questions: was the row
//! relevant before, and is it relevant now; which targets did it point at
//! before, and which now. The answers combine into a set of
//! [`UpdateOperation`]s:
//!
//! | aggregate | add row        | remove row       | value changed in place |
//! |-----------|----------------|------------------|------------------------|
//! | count     | `+1`           | `-1`             | nothing                |
//! | sum       | `+value`       | `-value`         | `+(new - old)`         |
//! | min/max   | candidate      | recompute        | recompute              |
//! | custom    | recompute      | recompute        | recompute              |
//!
//! A row that moves between targets is removed from the old ones and added
//! to the new ones; targets it stays on see the in-place change.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::{Aggregate, CacheConfiguration, ConfigId, Extreme};
use crate::error::Result;
use crate::record::{Mutation, SourceEvent, SourceRecord, Snapshot};
use crate::relevance::{Side, Transition, is_relevant, is_trashed};
use crate::resolve::KeyResolver;
use crate::value::{Key, Value};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// How a summary field changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// `field = field + amount` (count and sum).
    Add(Value),
    /// `field = extreme(field, candidate)` (min and max).
    Candidate { extreme: Extreme, value: Value },
    /// `field = (full aggregate subquery)`.
    Recompute,
}

/// A planned write to one summary field of one target row.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    /// Configuration the operation was planned for.
    pub configuration: ConfigId,
    pub target_model: String,
    pub key_field: String,
    pub target_key: Key,
    pub summary_field: String,
    pub change: Change,
    /// Whether the written row is fed back into the pipeline.
    pub propagate: bool,
    /// Skip deltas while the stored summary is NULL.
    pub lazy: bool,
    /// Summary value after the write; filled in by the executor.
    pub propagate_value: Option<Value>,
}

/// Identity of the cell an operation writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey {
    pub target_model: String,
    pub key_field: String,
    pub target_key: Key,
    pub summary_field: String,
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}={}].{}",
            self.target_model, self.key_field, self.target_key, self.summary_field
        )
    }
}

impl UpdateOperation {
    fn new(config: &CacheConfiguration, target_key: Key, change: Change) -> Self {
        Self {
            configuration: config.id,
            target_model: config.target_model.clone(),
            key_field: config.key_field.clone(),
            target_key,
            summary_field: config.summary_field.clone(),
            change,
            propagate: config.flags.propagate,
            lazy: config.flags.lazy,
            propagate_value: None,
        }
    }

    /// Plan a full recompute of `config`'s summary on one target.
    #[must_use]
    pub fn recompute(config: &CacheConfiguration, target_key: Key) -> Self {
        Self::new(config, target_key, Change::Recompute)
    }

    #[must_use]
    pub fn key(&self) -> OperationKey {
        OperationKey {
            target_model: self.target_model.clone(),
            key_field: self.key_field.clone(),
            target_key: self.target_key.clone(),
            summary_field: self.summary_field.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Relevance and targets of one event under one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub transition: Transition,
    pub old_keys: Vec<Key>,
    pub new_keys: Vec<Key>,
}

impl Classification {
    /// Every target the event can affect.
    #[must_use]
    pub fn affected_keys(&self) -> Vec<Key> {
        let mut seen = BTreeSet::new();
        self.old_keys
            .iter()
            .chain(&self.new_keys)
            .filter(|k| seen.insert(*k))
            .cloned()
            .collect()
    }
}

/// Plans [`UpdateOperation`]s for source events.
#[derive(Clone, Copy)]
pub struct DeltaEngine<'r> {
    resolver: KeyResolver<'r>,
}

impl<'r> DeltaEngine<'r> {
    #[must_use]
    pub const fn new(resolver: KeyResolver<'r>) -> Self {
        Self { resolver }
    }

    /// Determine relevance on both sides and the targets on both sides.
    ///
    /// Creates and restores only have a new side; deletes only an old one
    /// (evaluated on the row as it was when deleted). Soft deletion is read
    /// from the row before the deletion, so a trash reported as a deletion
    /// must carry the cleared column in its original snapshot.
    ///
    /// # Errors
    ///
    /// Propagates missing-attribute, unresolvable-target and lookup errors.
    pub fn classify(
        &self,
        config: &CacheConfiguration,
        event: &SourceEvent,
    ) -> Result<Classification> {
        let record = &event.record;
        let mutation = event.mutation;
        match mutation {
            Mutation::Created | Mutation::Restored => {
                let is = is_relevant(config, &record.current, Side::Current)?
                    && !is_trashed(config, &record.current);
                let new_keys = if is {
                    self.resolver.resolve(config, &record.current, mutation, true)?
                } else {
                    Vec::new()
                };
                Ok(Classification {
                    transition: Transition::from_flags(false, is),
                    old_keys: Vec::new(),
                    new_keys,
                })
            }
            Mutation::Deleted => {
                // A row already trashed before this deletion contributes nothing.
                let was = is_relevant(config, &record.current, Side::Current)?
                    && !is_trashed(config, &effective_original(record));
                let old_keys = if was {
                    self.resolver.resolve(config, &record.current, mutation, true)?
                } else {
                    Vec::new()
                };
                Ok(Classification {
                    transition: Transition::from_flags(was, false),
                    old_keys,
                    new_keys: Vec::new(),
                })
            }
            Mutation::Updated => {
                let before = effective_original(record);
                let is = is_relevant(config, &record.current, Side::Current)?
                    && !is_trashed(config, &record.current);
                let was = is_relevant(config, &record.original, Side::Original)?
                    && !is_trashed(config, &before);
                let new_keys = self.resolver.resolve(config, &record.current, mutation, is)?;
                let old_keys = self.resolver.resolve(config, &before, mutation, was)?;
                Ok(Classification {
                    transition: Transition::from_flags(was, is),
                    old_keys,
                    new_keys,
                })
            }
        }
    }

    /// Plan the operations one event requires under one configuration.
    ///
    /// # Errors
    ///
    /// See [`DeltaEngine::classify`].
    pub fn plan(
        &self,
        config: &CacheConfiguration,
        event: &SourceEvent,
    ) -> Result<Vec<UpdateOperation>> {
        let class = self.classify(config, event)?;
        let record = &event.record;
        let before = effective_original(record);
        let new_value = contribution_value(config, &record.current);
        let old_value = match event.mutation {
            Mutation::Deleted => contribution_value(config, &record.current),
            _ => contribution_value(config, &before),
        };

        let old: BTreeSet<&Key> = class.old_keys.iter().collect();
        let new: BTreeSet<&Key> = class.new_keys.iter().collect();
        let mut ops = Vec::new();

        // Targets the row leaves.
        if class.transition.was() {
            for key in class.old_keys.iter().filter(|k| !new.contains(k)) {
                ops.extend(removal(config, key, &old_value));
            }
        }

        // Targets the row stays on.
        for key in class.old_keys.iter().filter(|k| new.contains(k)) {
            let op = match class.transition {
                Transition::Outside => None,
                Transition::Entered => addition(config, key, &new_value),
                Transition::Left => removal(config, key, &old_value),
                Transition::Stayed => in_place(config, key, &old_value, &new_value),
            };
            ops.extend(op);
        }

        // Targets the row joins.
        if class.transition.is() {
            for key in class.new_keys.iter().filter(|k| !old.contains(k)) {
                ops.extend(addition(config, key, &new_value));
            }
        }

        Ok(ops)
    }
}

/// The original snapshot with unreported attributes taken from the current
/// one, so an attribute the host did not load reads as unchanged.
fn effective_original(record: &SourceRecord) -> Snapshot {
    let mut merged = record.current.clone();
    for (name, value) in record.original.iter() {
        merged.set(name, value.clone());
    }
    merged
}

fn contribution_value(config: &CacheConfiguration, snapshot: &Snapshot) -> Value {
    config
        .value_field
        .as_deref()
        .map_or(Value::Null, |field| snapshot.value(field))
}

fn addition(config: &CacheConfiguration, key: &Key, value: &Value) -> Option<UpdateOperation> {
    let change = match &config.aggregate {
        Aggregate::Count => Change::Add(Value::Integer(1)),
        Aggregate::Sum => {
            let amount = value.numeric_or_zero();
            if amount.is_zero() {
                return None;
            }
            Change::Add(amount)
        }
        Aggregate::Min | Aggregate::Max => {
            if value.is_null() {
                return None;
            }
            Change::Candidate {
                extreme: config.aggregate.extreme()?,
                value: value.clone(),
            }
        }
        Aggregate::Custom(_) => Change::Recompute,
    };
    Some(UpdateOperation::new(config, key.clone(), change))
}

fn removal(config: &CacheConfiguration, key: &Key, value: &Value) -> Option<UpdateOperation> {
    let change = match &config.aggregate {
        Aggregate::Count => Change::Add(Value::Integer(-1)),
        Aggregate::Sum => {
            let amount = value.numeric_neg();
            if amount.is_zero() {
                return None;
            }
            Change::Add(amount)
        }
        Aggregate::Min | Aggregate::Max => {
            if value.is_null() {
                return None;
            }
            Change::Recompute
        }
        Aggregate::Custom(_) => Change::Recompute,
    };
    Some(UpdateOperation::new(config, key.clone(), change))
}

fn in_place(
    config: &CacheConfiguration,
    key: &Key,
    old: &Value,
    new: &Value,
) -> Option<UpdateOperation> {
    let change = match &config.aggregate {
        Aggregate::Count => return None,
        Aggregate::Sum => {
            let diff = new.numeric_sub(old);
            if diff.is_zero() {
                return None;
            }
            Change::Add(diff)
        }
        Aggregate::Min | Aggregate::Max | Aggregate::Custom(_) => {
            if old == new {
                return None;
            }
            Change::Recompute
        }
    };
    Some(UpdateOperation::new(config, key.clone(), change))
}
