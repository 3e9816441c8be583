//! Dynamically typed cell values.
//!
//! Snapshots carry whatever the host row contained, so attribute values are
//! typed at runtime with SQLite's storage classes. [`Key`] is the hashable,
//! non-null subset used to identify target rows.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single attribute value, mirroring SQLite storage classes (minus BLOB).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value; text is parsed, null has none.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Coerce to a number the way SQL `sum()` does: null and non-numeric
    /// text contribute zero, integer-valued text stays integral.
    #[must_use]
    pub fn numeric_or_zero(&self) -> Self {
        match self {
            Self::Null => Self::Integer(0),
            Self::Integer(_) | Self::Real(_) => self.clone(),
            Self::Text(s) => {
                let trimmed = s.trim();
                trimmed.parse::<i64>().map_or_else(
                    |_| trimmed.parse::<f64>().map_or(Self::Integer(0), Self::Real),
                    Self::Integer,
                )
            }
        }
    }

    /// `self - other` over [`Value::numeric_or_zero`] coercions.
    ///
    /// Integer arithmetic is kept exact unless it overflows, in which case
    /// the result falls back to floating point.
    #[must_use]
    pub fn numeric_sub(&self, other: &Self) -> Self {
        match (self.numeric_or_zero(), other.numeric_or_zero()) {
            (Self::Integer(a), Self::Integer(b)) => a
                .checked_sub(b)
                .map_or_else(|| Self::Real(lossy(a) - lossy(b)), Self::Integer),
            (a, b) => Self::Real(a.as_f64().unwrap_or(0.0) - b.as_f64().unwrap_or(0.0)),
        }
    }

    /// `self + other` over [`Value::numeric_or_zero`] coercions.
    #[must_use]
    pub fn numeric_add(&self, other: &Self) -> Self {
        match (self.numeric_or_zero(), other.numeric_or_zero()) {
            (Self::Integer(a), Self::Integer(b)) => a
                .checked_add(b)
                .map_or_else(|| Self::Real(lossy(a) + lossy(b)), Self::Integer),
            (a, b) => Self::Real(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        }
    }

    /// Arithmetic negation over the numeric coercion.
    #[must_use]
    pub fn numeric_neg(&self) -> Self {
        Self::Integer(0).numeric_sub(self)
    }

    /// True for numeric zero (including null, which coerces to zero).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self.numeric_or_zero() {
            Self::Integer(i) => i == 0,
            Self::Real(r) => r == 0.0,
            Self::Null | Self::Text(_) => false,
        }
    }

    /// Compare two values with SQL semantics: anything involving null is
    /// unknown (`None`); numbers compare numerically even across storage
    /// classes; text compares to a number only if it parses as one.
    #[must_use]
    pub fn sql_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    /// SQL equality; `None` when unknown.
    #[must_use]
    pub fn sql_eq(&self, other: &Self) -> Option<bool> {
        self.sql_cmp(other).map(Ordering::is_eq)
    }
}

#[allow(clippy::cast_precision_loss)]
const fn lossy(i: i64) -> f64 {
    i as f64
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Integer(i) => Self::Integer(i),
            Key::Text(s) => Self::Text(s),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Self::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Self::Null),
            ValueRef::Integer(i) => Ok(Self::Integer(i)),
            ValueRef::Real(r) => Ok(Self::Real(r)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|err| FromSqlError::Other(Box::new(err))),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// Identity of a target row. Never null, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Integer(i64),
    Text(String),
}

impl Key {
    /// Convert a raw foreign-key value into a key, filtering null and empty
    /// text. Integral reals and integer-looking text normalize to integers so
    /// `"7"`, `7` and `7.0` all address the same row.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::float_cmp
    )]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Integer(i) => Some(Self::Integer(*i)),
            Value::Real(r) => {
                let truncated = *r as i64;
                if truncated as f64 == *r {
                    Some(Self::Integer(truncated))
                } else {
                    Some(Self::Text(r.to_string()))
                }
            }
            Value::Text(s) => Self::parse(s),
        }
    }

    /// Parse one textual key segment.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(
            trimmed
                .parse::<i64>()
                .map_or_else(|_| Self::Text(trimmed.to_string()), Self::Integer),
        )
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let value = Value::column_result(value)?;
        Self::from_value(&value).ok_or(FromSqlError::InvalidType)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
