//! Aggregate declarations.
//!
//! Hosts declare aggregates with [`CacheConfig`], a serde-friendly struct
//! whose optional fields carry documented defaults. It can be built in code
//! with the chained constructors below or deserialized from TOML
//! (`[[aggregate]]` tables). [`CacheConfig::normalize`] validates one
//! declaration in isolation and produces the immutable
//! [`CacheConfiguration`] the engine works with; cross-declaration checks
//! live in [`crate::registry`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::is_valid_identifier;
use crate::error::{CacheError, Result};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// The closed set of reductions the engine maintains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Count,
    Sum,
    Min,
    Max,
    /// A SQL aggregate function maintained by full recompute only
    /// (`group_concat`, `avg`, ...).
    Custom(String),
}

/// Which extreme a min/max aggregate tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extreme {
    Min,
    Max,
}

impl Aggregate {
    /// Whether closed-form deltas exist for this function at all.
    #[must_use]
    pub const fn is_incremental(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Whether the function reads a value column from the source.
    #[must_use]
    pub const fn reads_value(&self) -> bool {
        !matches!(self, Self::Count)
    }

    #[must_use]
    pub const fn extreme(&self) -> Option<Extreme> {
        match self {
            Self::Min => Some(Extreme::Min),
            Self::Max => Some(Extreme::Max),
            Self::Count | Self::Sum | Self::Custom(_) => None,
        }
    }

    /// The value of the aggregate over zero rows.
    #[must_use]
    pub const fn identity(&self) -> Value {
        match self {
            Self::Count | Self::Sum => Value::Integer(0),
            Self::Min | Self::Max | Self::Custom(_) => Value::Null,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "custom:{name}"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            lowered => {
                let Some(name) = lowered.strip_prefix("custom:") else {
                    return Err(format!(
                        "unknown function '{trimmed}': expected count, sum, min, max or custom:<name>"
                    ));
                };
                if is_valid_identifier(name) {
                    Ok(Self::Custom(name.to_string()))
                } else {
                    Err(format!("custom function name '{name}' is not a plain identifier"))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Comparison operators allowed in relevance conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl Operator {
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "IN",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Self::Eq),
            "<>" | "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "in" => Ok(Self::In),
            other => Err(format!(
                "unknown operator '{other}': expected =, <>, <, <=, >, >= or in"
            )),
        }
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    One(Value),
    Many(Vec<Value>),
}

/// One normalized relevance condition: `attribute operator literal`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attribute: String,
    pub operator: Operator,
    pub literal: Literal,
}

/// Accepted shapes for a condition in a declaration.
///
/// `["status", "paid"]` is shorthand for equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Triple(String, String, Literal),
    Pair(String, Literal),
    Keyed {
        attribute: String,
        #[serde(default = "default_operator")]
        operator: String,
        value: Literal,
    },
}

fn default_operator() -> String {
    "=".to_string()
}

impl ConditionSpec {
    fn normalize(self, configuration: &str) -> Result<Condition> {
        let (attribute, operator, literal) = match self {
            Self::Triple(attribute, operator, literal)
            | Self::Keyed {
                attribute,
                operator,
                value: literal,
            } => (attribute, operator, literal),
            Self::Pair(attribute, literal) => (attribute, default_operator(), literal),
        };

        if !is_valid_identifier(&attribute) {
            return Err(CacheError::invalid_relation(
                configuration,
                format!("condition attribute '{attribute}' is not a plain identifier"),
            ));
        }
        let operator: Operator = operator
            .parse()
            .map_err(|reason: String| CacheError::invalid_relation(configuration, reason))?;

        let literal = match (operator, literal) {
            (Operator::In, Literal::One(value)) => Literal::Many(vec![value]),
            (Operator::In, many @ Literal::Many(_)) => many,
            (_, Literal::Many(_)) => {
                return Err(CacheError::invalid_relation(
                    configuration,
                    format!("operator {operator} on '{attribute}' takes a single value"),
                ));
            }
            (_, one @ Literal::One(_)) => one,
        };

        Ok(Condition {
            attribute,
            operator,
            literal,
        })
    }
}

// ---------------------------------------------------------------------------
// Foreign-key strategies
// ---------------------------------------------------------------------------

/// Discriminator for polymorphic pivot tables (`taggable_type = 'posts'`).
#[derive(Debug, Clone, PartialEq)]
pub struct Discriminator {
    pub column: String,
    pub value: Value,
}

/// An intermediate association table linking sources to targets.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotRelation {
    pub table: String,
    /// Pivot column holding the source row's key.
    pub source_column: String,
    /// Pivot column holding the target row's key.
    pub target_column: String,
    pub discriminator: Option<Discriminator>,
}

/// How target identities are extracted from a source row.
#[derive(Debug, Clone, PartialEq)]
pub enum ForeignKeyStrategy {
    /// The foreign key column holds the single target key.
    Direct,
    /// The foreign key column holds a delimited ancestor chain; every
    /// segment is a target key.
    Path { separator: String },
    /// Targets are enumerated through an association table keyed by the
    /// source row's own identity.
    ThroughPivot(PivotRelation),
}

impl ForeignKeyStrategy {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Path { .. } => "path",
            Self::ThroughPivot(_) => "pivot",
        }
    }
}

/// Declarative strategy shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategySpec {
    #[default]
    Direct,
    Path {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Pivot {
        table: String,
        source_column: String,
        target_column: String,
        #[serde(default)]
        discriminator_column: Option<String>,
        #[serde(default)]
        discriminator_value: Option<Value>,
    },
}

fn default_separator() -> String {
    "/".to_string()
}

// ---------------------------------------------------------------------------
// CacheConfig (declarative input)
// ---------------------------------------------------------------------------

/// One aggregate declaration as written by the host.
///
/// Defaults: `key_field = "id"`, `source_key_field = "id"`, strategy
/// `direct`, no conditions, every flag `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Stable name; stored in the deferred log. Derived when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// `count`, `sum`, `min`, `max` or `custom:<sql aggregate>`.
    pub function: String,
    /// Source table.
    pub source: String,
    /// Target table.
    pub target: String,
    /// Source column read by sum/min/max/custom.
    #[serde(default)]
    pub value_field: Option<String>,
    /// Target column written.
    pub summary_field: String,
    /// Identity column on the target.
    #[serde(default = "default_id")]
    pub key_field: String,
    /// Source column holding the foreign key (direct/path) or, for pivot
    /// relations, ignored in favour of `source_key_field`.
    #[serde(default)]
    pub foreign_key: Option<String>,
    /// Identity column on the source.
    #[serde(default = "default_id")]
    pub source_key_field: String,
    #[serde(default)]
    pub strategy: StrategySpec,
    #[serde(default, rename = "where")]
    pub conditions: Vec<ConditionSpec>,
    /// Source column marking soft-deleted rows (non-null = deleted).
    #[serde(default)]
    pub soft_delete_field: Option<String>,
    #[serde(default)]
    pub ignore_empty_foreign_keys: bool,
    #[serde(default)]
    pub propagate: bool,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub asynchronous: bool,
}

fn default_id() -> String {
    "id".to_string()
}

impl CacheConfig {
    fn base(function: &str, source: &str, target: &str, summary_field: &str) -> Self {
        Self {
            name: None,
            function: function.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            value_field: None,
            summary_field: summary_field.to_string(),
            key_field: default_id(),
            foreign_key: None,
            source_key_field: default_id(),
            strategy: StrategySpec::Direct,
            conditions: Vec::new(),
            soft_delete_field: None,
            ignore_empty_foreign_keys: false,
            propagate: false,
            manual: false,
            lazy: false,
            hidden: false,
            asynchronous: false,
        }
    }

    /// `target.summary_field = count(source rows where source.foreign_key = target.id)`
    #[must_use]
    pub fn count(source: &str, foreign_key: &str, target: &str, summary_field: &str) -> Self {
        Self {
            foreign_key: Some(foreign_key.to_string()),
            ..Self::base("count", source, target, summary_field)
        }
    }

    #[must_use]
    pub fn sum(
        source: &str,
        value_field: &str,
        foreign_key: &str,
        target: &str,
        summary_field: &str,
    ) -> Self {
        Self::valued("sum", source, value_field, foreign_key, target, summary_field)
    }

    #[must_use]
    pub fn min(
        source: &str,
        value_field: &str,
        foreign_key: &str,
        target: &str,
        summary_field: &str,
    ) -> Self {
        Self::valued("min", source, value_field, foreign_key, target, summary_field)
    }

    #[must_use]
    pub fn max(
        source: &str,
        value_field: &str,
        foreign_key: &str,
        target: &str,
        summary_field: &str,
    ) -> Self {
        Self::valued("max", source, value_field, foreign_key, target, summary_field)
    }

    /// Recompute-only aggregate using an arbitrary SQL aggregate function.
    #[must_use]
    pub fn custom(
        function: &str,
        source: &str,
        value_field: &str,
        foreign_key: &str,
        target: &str,
        summary_field: &str,
    ) -> Self {
        Self::valued(
            &format!("custom:{function}"),
            source,
            value_field,
            foreign_key,
            target,
            summary_field,
        )
    }

    fn valued(
        function: &str,
        source: &str,
        value_field: &str,
        foreign_key: &str,
        target: &str,
        summary_field: &str,
    ) -> Self {
        Self {
            value_field: Some(value_field.to_string()),
            foreign_key: Some(foreign_key.to_string()),
            ..Self::base(function, source, target, summary_field)
        }
    }

    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn key_field(mut self, key_field: &str) -> Self {
        self.key_field = key_field.to_string();
        self
    }

    #[must_use]
    pub fn source_key_field(mut self, field: &str) -> Self {
        self.source_key_field = field.to_string();
        self
    }

    /// Add a relevance condition.
    #[must_use]
    pub fn condition(mut self, attribute: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(ConditionSpec::Triple(
            attribute.to_string(),
            operator.to_string(),
            Literal::One(value.into()),
        ));
        self
    }

    /// Add an `attribute IN (values)` condition.
    #[must_use]
    pub fn condition_in(mut self, attribute: &str, values: Vec<Value>) -> Self {
        self.conditions.push(ConditionSpec::Triple(
            attribute.to_string(),
            "in".to_string(),
            Literal::Many(values),
        ));
        self
    }

    /// Treat the foreign key as a delimited ancestor path.
    #[must_use]
    pub fn path(mut self, separator: &str) -> Self {
        self.strategy = StrategySpec::Path {
            separator: separator.to_string(),
        };
        self
    }

    /// Resolve targets through an association table.
    #[must_use]
    pub fn through_pivot(mut self, table: &str, source_column: &str, target_column: &str) -> Self {
        self.strategy = StrategySpec::Pivot {
            table: table.to_string(),
            source_column: source_column.to_string(),
            target_column: target_column.to_string(),
            discriminator_column: None,
            discriminator_value: None,
        };
        self
    }

    /// Constrain a pivot relation by a type discriminator column.
    #[must_use]
    pub fn discriminator(mut self, column: &str, value: impl Into<Value>) -> Self {
        if let StrategySpec::Pivot {
            discriminator_column,
            discriminator_value,
            ..
        } = &mut self.strategy
        {
            *discriminator_column = Some(column.to_string());
            *discriminator_value = Some(value.into());
        }
        self
    }

    #[must_use]
    pub fn soft_delete(mut self, field: &str) -> Self {
        self.soft_delete_field = Some(field.to_string());
        self
    }

    #[must_use]
    pub const fn ignore_empty_foreign_keys(mut self) -> Self {
        self.ignore_empty_foreign_keys = true;
        self
    }

    #[must_use]
    pub const fn propagate(mut self) -> Self {
        self.propagate = true;
        self
    }

    #[must_use]
    pub const fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    #[must_use]
    pub const fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    #[must_use]
    pub const fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    #[must_use]
    pub const fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Display name used when none was declared.
    #[must_use]
    pub fn derived_name(&self) -> String {
        let value = self.value_field.as_deref().unwrap_or("*");
        format!(
            "{}({}.{}) -> {}.{}",
            self.function.trim(),
            self.source,
            value,
            self.target,
            self.summary_field
        )
    }

    /// Validate this declaration on its own and produce the normalized form.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnsupportedAggregation`] for unknown or
    /// misapplied functions and [`CacheError::InvalidRelation`] for
    /// malformed identifiers, strategies or conditions.
    pub fn normalize(self, id: ConfigId) -> Result<CacheConfiguration> {
        let name = self.name.clone().unwrap_or_else(|| self.derived_name());

        let aggregate: Aggregate = self
            .function
            .parse()
            .map_err(|reason: String| CacheError::unsupported(&name, reason))?;

        for (what, ident) in [
            ("source", self.source.as_str()),
            ("target", self.target.as_str()),
            ("summary_field", self.summary_field.as_str()),
            ("key_field", self.key_field.as_str()),
            ("source_key_field", self.source_key_field.as_str()),
        ] {
            require_identifier(&name, what, ident)?;
        }
        if let Some(field) = &self.soft_delete_field {
            require_identifier(&name, "soft_delete_field", field)?;
        }

        let value_field = match (aggregate.reads_value(), self.value_field) {
            (true, Some(field)) => {
                require_identifier(&name, "value_field", &field)?;
                Some(field)
            }
            (true, None) => {
                return Err(CacheError::unsupported(
                    &name,
                    format!("{aggregate} requires a value_field"),
                ));
            }
            (false, Some(field)) => {
                return Err(CacheError::unsupported(
                    &name,
                    format!("count does not read a value field (got '{field}')"),
                ));
            }
            (false, None) => None,
        };

        let strategy = normalize_strategy(&name, self.strategy)?;
        let foreign_key_field = match (&strategy, self.foreign_key) {
            (ForeignKeyStrategy::ThroughPivot(_), _) => self.source_key_field.clone(),
            (_, Some(field)) => {
                require_identifier(&name, "foreign_key", &field)?;
                field
            }
            (_, None) => {
                return Err(CacheError::invalid_relation(
                    &name,
                    "direct and path relations require a foreign_key",
                ));
            }
        };

        if self.source == self.target && foreign_key_field == self.summary_field {
            return Err(CacheError::invalid_relation(
                &name,
                "summary_field cannot also be the foreign key",
            ));
        }

        let conditions = self
            .conditions
            .into_iter()
            .map(|spec| spec.normalize(&name))
            .collect::<Result<Vec<_>>>()?;

        Ok(CacheConfiguration {
            id,
            name,
            aggregate,
            source_model: self.source,
            target_model: self.target,
            value_field,
            summary_field: self.summary_field,
            key_field: self.key_field,
            foreign_key_field,
            source_key_field: self.source_key_field,
            strategy,
            conditions,
            soft_delete_field: self.soft_delete_field,
            flags: Flags {
                ignore_empty_foreign_keys: self.ignore_empty_foreign_keys,
                propagate: self.propagate,
                manual: self.manual,
                lazy: self.lazy,
                hidden: self.hidden,
                asynchronous: self.asynchronous,
            },
        })
    }
}

fn require_identifier(configuration: &str, what: &str, ident: &str) -> Result<()> {
    if is_valid_identifier(ident) {
        Ok(())
    } else {
        Err(CacheError::invalid_relation(
            configuration,
            format!("{what} '{ident}' is not a plain identifier"),
        ))
    }
}

fn normalize_strategy(configuration: &str, spec: StrategySpec) -> Result<ForeignKeyStrategy> {
    match spec {
        StrategySpec::Direct => Ok(ForeignKeyStrategy::Direct),
        StrategySpec::Path { separator } => {
            if separator.is_empty() {
                return Err(CacheError::invalid_relation(
                    configuration,
                    "path separator cannot be empty",
                ));
            }
            Ok(ForeignKeyStrategy::Path { separator })
        }
        StrategySpec::Pivot {
            table,
            source_column,
            target_column,
            discriminator_column,
            discriminator_value,
        } => {
            require_identifier(configuration, "pivot table", &table)?;
            require_identifier(configuration, "pivot source_column", &source_column)?;
            require_identifier(configuration, "pivot target_column", &target_column)?;
            let discriminator = match (discriminator_column, discriminator_value) {
                (None, None) => None,
                (Some(column), Some(value)) if !value.is_null() => {
                    require_identifier(configuration, "pivot discriminator_column", &column)?;
                    Some(Discriminator { column, value })
                }
                _ => {
                    return Err(CacheError::invalid_relation(
                        configuration,
                        "pivot discriminator needs both a column and a non-null value",
                    ));
                }
            };
            Ok(ForeignKeyStrategy::ThroughPivot(PivotRelation {
                table,
                source_column,
                target_column,
                discriminator,
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// CacheConfiguration (normalized)
// ---------------------------------------------------------------------------

/// Index of a configuration inside its [`crate::registry::Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(pub usize);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Behaviour switches of one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub ignore_empty_foreign_keys: bool,
    pub propagate: bool,
    /// Maintained by rebuild/refresh only, never by events.
    pub manual: bool,
    /// Deltas skip NULL (uninitialized) summaries; reads populate them.
    pub lazy: bool,
    /// Not listed among a model's visible summary fields.
    pub hidden: bool,
    /// Applied out-of-band through the deferred log.
    pub asynchronous: bool,
}

/// A validated aggregate declaration. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfiguration {
    pub id: ConfigId,
    pub name: String,
    pub aggregate: Aggregate,
    pub source_model: String,
    pub target_model: String,
    pub value_field: Option<String>,
    pub summary_field: String,
    pub key_field: String,
    pub foreign_key_field: String,
    pub source_key_field: String,
    pub strategy: ForeignKeyStrategy,
    pub conditions: Vec<Condition>,
    pub soft_delete_field: Option<String>,
    pub flags: Flags,
}

impl CacheConfiguration {
    /// Whether the event pipeline maintains this configuration inline.
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        !self.flags.manual && !self.flags.asynchronous
    }

    /// Attributes of the source row this configuration reads.
    pub fn source_attributes(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .map(|c| c.attribute.as_str())
            .chain(self.value_field.as_deref())
            .chain(std::iter::once(self.foreign_key_field.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_parses_builtin_and_custom() {
        assert_eq!("SUM".parse::<Aggregate>(), Ok(Aggregate::Sum));
        assert_eq!(
            "custom:group_concat".parse::<Aggregate>(),
            Ok(Aggregate::Custom("group_concat".into()))
        );
        assert!("median".parse::<Aggregate>().is_err());
        assert!("custom:drop table".parse::<Aggregate>().is_err());
    }

    #[test]
    fn normalize_fills_defaults() {
        let config = CacheConfig::sum("items", "total", "order_id", "orders", "item_total")
            .normalize(ConfigId(0))
            .expect("normalize");
        assert_eq!(config.name, "sum(items.total) -> orders.item_total");
        assert_eq!(config.key_field, "id");
        assert_eq!(config.strategy, ForeignKeyStrategy::Direct);
        assert!(config.is_synchronous());
        assert!(config.conditions.is_empty());
    }

    #[test]
    fn normalize_rejects_sum_without_value_field() {
        let mut config = CacheConfig::count("items", "order_id", "orders", "n");
        config.function = "sum".into();
        let err = config.normalize(ConfigId(0)).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedAggregation { .. }), "{err}");
    }

    #[test]
    fn normalize_rejects_count_with_value_field() {
        let mut config = CacheConfig::count("items", "order_id", "orders", "n");
        config.value_field = Some("total".into());
        assert!(config.normalize(ConfigId(0)).is_err());
    }

    #[test]
    fn normalize_rejects_unsafe_identifiers() {
        let config = CacheConfig::count("items; drop", "order_id", "orders", "n");
        let err = config.normalize(ConfigId(0)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidRelation { .. }), "{err}");
    }

    #[test]
    fn in_operator_wraps_single_literal() {
        let config = CacheConfig::count("items", "order_id", "orders", "n")
            .condition("status", "in", "paid")
            .normalize(ConfigId(0))
            .expect("normalize");
        assert_eq!(config.conditions[0].operator, Operator::In);
        assert_eq!(
            config.conditions[0].literal,
            Literal::Many(vec![Value::from("paid")])
        );
    }

    #[test]
    fn comparison_operator_rejects_list_literal() {
        let mut config = CacheConfig::count("items", "order_id", "orders", "n");
        config.conditions.push(ConditionSpec::Triple(
            "total".into(),
            ">".into(),
            Literal::Many(vec![Value::Integer(1)]),
        ));
        assert!(config.normalize(ConfigId(0)).is_err());
    }

    #[test]
    fn pivot_uses_source_key_as_foreign_key() {
        let config = CacheConfig::count("posts", "id", "tags", "post_count")
            .through_pivot("taggables", "taggable_id", "tag_id")
            .discriminator("taggable_type", "post")
            .normalize(ConfigId(3))
            .expect("normalize");
        assert_eq!(config.foreign_key_field, "id");
        let ForeignKeyStrategy::ThroughPivot(pivot) = &config.strategy else {
            panic!("expected pivot strategy");
        };
        assert_eq!(pivot.table, "taggables");
        assert_eq!(
            pivot.discriminator,
            Some(Discriminator {
                column: "taggable_type".into(),
                value: Value::from("post"),
            })
        );
    }

    #[test]
    fn declarations_deserialize_from_mixed_condition_shapes() {
        let toml_src = r#"
            function = "sum"
            source = "items"
            target = "orders"
            value_field = "total"
            summary_field = "paid_total"
            foreign_key = "order_id"
            where = [
                ["status", "paid"],
                ["total", ">", 0],
                { attribute = "kind", operator = "in", value = ["a", "b"] },
            ]
            strategy = { kind = "path", separator = "." }
            propagate = true
        "#;
        let config: CacheConfig = toml::from_str(toml_src).expect("parse toml");
        let normalized = config.normalize(ConfigId(0)).expect("normalize");
        assert_eq!(normalized.conditions.len(), 3);
        assert_eq!(normalized.conditions[0].operator, Operator::Eq);
        assert_eq!(normalized.conditions[1].operator, Operator::Gt);
        assert_eq!(normalized.conditions[2].operator, Operator::In);
        assert_eq!(
            normalized.strategy,
            ForeignKeyStrategy::Path {
                separator: ".".into()
            }
        );
        assert!(normalized.flags.propagate);
    }
}
