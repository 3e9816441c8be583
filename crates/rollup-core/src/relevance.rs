//! Decides whether a snapshot contributes to a configuration's aggregate.
//!
//! The comparison rules mirror what the recompute SQL does with the same
//! conditions, so an incrementally maintained summary and a recomputed one
//! agree row for row: null never satisfies an ordering comparison, `= null`
//! means `IS NULL`, and `<> null` means `IS NOT NULL`.

use crate::config::{CacheConfiguration, Condition, Literal, Operator};
use crate::error::{CacheError, Result};
use crate::record::Snapshot;
use crate::value::Value;

/// Which side of a mutation a snapshot represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Missing attributes are a caller error.
    Current,
    /// Missing attributes make the snapshot irrelevant.
    Original,
}

/// Relevance of a row before and after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Outside,
    Entered,
    Left,
    Stayed,
}

impl Transition {
    #[must_use]
    pub const fn from_flags(was: bool, is: bool) -> Self {
        match (was, is) {
            (false, false) => Self::Outside,
            (false, true) => Self::Entered,
            (true, false) => Self::Left,
            (true, true) => Self::Stayed,
        }
    }

    #[must_use]
    pub const fn was(self) -> bool {
        matches!(self, Self::Left | Self::Stayed)
    }

    #[must_use]
    pub const fn is(self) -> bool {
        matches!(self, Self::Entered | Self::Stayed)
    }
}

/// True when `snapshot` satisfies every condition of `config`.
///
/// A configuration without conditions treats every row as relevant.
///
/// # Errors
///
/// Returns [`CacheError::MissingAttribute`] when a condition attribute is
/// absent from a [`Side::Current`] snapshot.
pub fn is_relevant(config: &CacheConfiguration, snapshot: &Snapshot, side: Side) -> Result<bool> {
    for condition in &config.conditions {
        let Some(value) = snapshot.get(&condition.attribute) else {
            return match side {
                Side::Current => Err(CacheError::MissingAttribute {
                    field: condition.attribute.clone(),
                    aggregate: config.name.clone(),
                    summary_field: config.summary_field.clone(),
                }),
                Side::Original => Ok(false),
            };
        };
        if !satisfies(condition, value) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// True when the row is soft-deleted according to `config`.
#[must_use]
pub fn is_trashed(config: &CacheConfiguration, snapshot: &Snapshot) -> bool {
    config
        .soft_delete_field
        .as_deref()
        .and_then(|field| snapshot.get(field))
        .is_some_and(|value| !value.is_null())
}

/// Evaluate one condition against an attribute value.
#[must_use]
pub fn satisfies(condition: &Condition, value: &Value) -> bool {
    match (&condition.operator, &condition.literal) {
        (Operator::In, Literal::Many(options)) => {
            options.iter().any(|option| value.sql_eq(option) == Some(true))
        }
        (Operator::In, Literal::One(option)) => value.sql_eq(option) == Some(true),
        (_, Literal::Many(_)) => false,
        (Operator::Eq, Literal::One(Value::Null)) => value.is_null(),
        (Operator::Ne, Literal::One(Value::Null)) => !value.is_null(),
        (operator, Literal::One(literal)) => value.sql_cmp(literal).is_some_and(|ordering| {
            match operator {
                Operator::Eq => ordering.is_eq(),
                Operator::Ne => ordering.is_ne(),
                Operator::Lt => ordering.is_lt(),
                Operator::Le => ordering.is_le(),
                Operator::Gt => ordering.is_gt(),
                Operator::Ge => ordering.is_ge(),
                Operator::In => false,
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ConfigId};

    fn paid_items() -> CacheConfiguration {
        CacheConfig::sum("items", "total", "order_id", "orders", "paid_total")
            .condition("status", "=", "paid")
            .condition("total", ">", 0)
            .soft_delete("deleted_at")
            .normalize(ConfigId(0))
            .expect("normalize")
    }

    #[test]
    fn all_conditions_must_hold() {
        let config = paid_items();
        let paid = Snapshot::new().with("status", "paid").with("total", 5);
        let draft = Snapshot::new().with("status", "draft").with("total", 5);
        let zero = Snapshot::new().with("status", "paid").with("total", 0);

        assert!(is_relevant(&config, &paid, Side::Current).expect("paid"));
        assert!(!is_relevant(&config, &draft, Side::Current).expect("draft"));
        assert!(!is_relevant(&config, &zero, Side::Current).expect("zero"));
    }

    #[test]
    fn missing_current_attribute_is_an_error() {
        let config = paid_items();
        let partial = Snapshot::new().with("total", 5);
        let err = is_relevant(&config, &partial, Side::Current).unwrap_err();
        let CacheError::MissingAttribute { field, .. } = err else {
            panic!("expected missing attribute");
        };
        assert_eq!(field, "status");
    }

    #[test]
    fn missing_original_attribute_is_irrelevant() {
        let config = paid_items();
        assert!(!is_relevant(&config, &Snapshot::new(), Side::Original).expect("original"));
    }

    #[test]
    fn null_comparisons_follow_sql() {
        let config = paid_items();
        let null_total = Snapshot::new().with("status", "paid").with("total", Value::Null);
        assert!(!is_relevant(&config, &null_total, Side::Current).expect("null"));

        let is_null = CacheConfig::count("items", "order_id", "orders", "open")
            .condition("closed_at", "=", Value::Null)
            .normalize(ConfigId(1))
            .expect("normalize");
        let open = Snapshot::new().with("closed_at", Value::Null);
        let closed = Snapshot::new().with("closed_at", 17);
        assert!(is_relevant(&is_null, &open, Side::Current).expect("open"));
        assert!(!is_relevant(&is_null, &closed, Side::Current).expect("closed"));
    }

    #[test]
    fn in_matches_any_option_across_storage_classes() {
        let config = CacheConfig::count("items", "order_id", "orders", "n")
            .condition_in("priority", vec![Value::Integer(1), Value::from("2")])
            .normalize(ConfigId(0))
            .expect("normalize");
        let cases = [
            (Value::Integer(1), true),
            (Value::Real(2.0), true),
            (Value::Integer(3), false),
        ];
        for (raw, expected) in cases {
            let snapshot = Snapshot::new().with("priority", raw.clone());
            assert_eq!(
                is_relevant(&config, &snapshot, Side::Current).expect("eval"),
                expected,
                "priority {raw}"
            );
        }
    }

    #[test]
    fn soft_deleted_rows_are_trashed() {
        let config = paid_items();
        assert!(is_trashed(&config, &Snapshot::new().with("deleted_at", 100)));
        assert!(!is_trashed(&config, &Snapshot::new().with("deleted_at", Value::Null)));
        assert!(!is_trashed(&config, &Snapshot::new()));
    }

    #[test]
    fn transition_flags_roundtrip() {
        for was in [false, true] {
            for is in [false, true] {
                let transition = Transition::from_flags(was, is);
                assert_eq!((transition.was(), transition.is()), (was, is));
            }
        }
    }
}
