//! Source-record snapshots supplied by the host for each mutation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::value::{Key, Value};

/// Attribute values of one row at one point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    attributes: BTreeMap<String, Value>,
}

impl Snapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// `None` means the attribute was not loaded, as opposed to loaded null.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Loaded value or null.
    #[must_use]
    pub fn value(&self, name: &str) -> Value {
        self.attributes.get(name).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// The kind of source mutation being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutation {
    Created,
    Updated,
    Deleted,
    /// Soft-delete reversal.
    Restored,
}

impl Mutation {
    pub const ALL: [Self; 4] = [Self::Created, Self::Updated, Self::Deleted, Self::Restored];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown mutation string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMutation {
    pub raw: String,
}

impl fmt::Display for UnknownMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown mutation '{}': expected one of created, updated, deleted, restored",
            self.raw
        )
    }
}

impl std::error::Error for UnknownMutation {}

impl FromStr for Mutation {
    type Err = UnknownMutation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            "restored" => Ok(Self::Restored),
            _ => Err(UnknownMutation { raw: s.to_string() }),
        }
    }
}

/// A mutated source row: its model, identity and before/after attributes.
///
/// `original` is empty for a freshly created row. For deletes the host
/// passes the row as it was at deletion time in `current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub model: String,
    pub key: Option<Key>,
    pub current: Snapshot,
    pub original: Snapshot,
}

impl SourceRecord {
    #[must_use]
    pub fn new(model: impl Into<String>, current: Snapshot) -> Self {
        Self {
            model: model.into(),
            key: None,
            current,
            original: Snapshot::new(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_original(mut self, original: Snapshot) -> Self {
        self.original = original;
        self
    }
}

/// A source record together with the mutation that happened to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub mutation: Mutation,
    pub record: SourceRecord,
}

impl SourceEvent {
    #[must_use]
    pub const fn new(mutation: Mutation, record: SourceRecord) -> Self {
        Self { mutation, record }
    }

    #[must_use]
    pub const fn created(record: SourceRecord) -> Self {
        Self::new(Mutation::Created, record)
    }

    #[must_use]
    pub const fn updated(record: SourceRecord) -> Self {
        Self::new(Mutation::Updated, record)
    }

    #[must_use]
    pub const fn deleted(record: SourceRecord) -> Self {
        Self::new(Mutation::Deleted, record)
    }

    #[must_use]
    pub const fn restored(record: SourceRecord) -> Self {
        Self::new(Mutation::Restored, record)
    }
}
