//! Turning a source row's foreign-key value into target keys.
//!
//! Three strategies exist:
//! - direct: the value is the one target key
//! - path: the value is a delimited ancestor chain, every segment a target
//! - pivot: targets come from an association table keyed by the source row
//!
//! Pivot lookups go through a [`KeySetProvider`], so tests and hosts with
//! their own storage can supply key sets without SQL. [`KeySetCache`]
//! memoizes lookups for the duration of one event.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use rusqlite::Connection;

use crate::config::{CacheConfiguration, ForeignKeyStrategy, PivotRelation};
use crate::db::quote_ident;
use crate::error::{CacheError, Result};
use crate::record::{Mutation, Snapshot};
use crate::value::{Key, Value};

// ---------------------------------------------------------------------------
// Key-set providers
// ---------------------------------------------------------------------------

/// Supplies the target keys linked to a source row through a pivot table.
pub trait KeySetProvider {
    /// Keys in the pivot's target column for rows whose source column is
    /// `source_key` (and whose discriminator matches, if any).
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn linked_keys(&self, relation: &PivotRelation, source_key: &Key) -> Result<Vec<Key>>;
}

/// Reads pivot rows from the host database.
#[derive(Debug, Clone, Copy)]
pub struct SqlKeySetProvider<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqlKeySetProvider<'conn> {
    #[must_use]
    pub const fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl KeySetProvider for SqlKeySetProvider<'_> {
    fn linked_keys(&self, relation: &PivotRelation, source_key: &Key) -> Result<Vec<Key>> {
        let mut sql = format!(
            "SELECT DISTINCT {target} FROM {table} WHERE {source} = ?",
            target = quote_ident(&relation.target_column),
            table = quote_ident(&relation.table),
            source = quote_ident(&relation.source_column),
        );
        let mut params: Vec<Value> = vec![source_key.clone().into()];
        if let Some(discriminator) = &relation.discriminator {
            sql.push_str(&format!(" AND {} = ?", quote_ident(&discriminator.column)));
            params.push(discriminator.value.clone());
        }
        sql.push_str(&format!(" ORDER BY {}", quote_ident(&relation.target_column)));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            row.get::<_, Value>(0)
        })?;
        let mut keys = Vec::new();
        for value in rows {
            if let Some(key) = Key::from_value(&value?) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    table: String,
    source_column: String,
    target_column: String,
    discriminator: Option<String>,
    source_key: Key,
}

impl CacheKey {
    fn new(relation: &PivotRelation, source_key: &Key) -> Self {
        Self {
            table: relation.table.clone(),
            source_column: relation.source_column.clone(),
            target_column: relation.target_column.clone(),
            discriminator: relation
                .discriminator
                .as_ref()
                .map(|d| format!("{}={}", d.column, d.value)),
            source_key: source_key.clone(),
        }
    }
}

/// Memoizes another provider's lookups.
///
/// Keyed by the whole pivot relation and the source key; meant to live for
/// a single event so that one row's fan-out is resolved once even when
/// several configurations share the relation.
pub struct KeySetCache<'p> {
    inner: &'p dyn KeySetProvider,
    entries: RefCell<HashMap<CacheKey, Vec<Key>>>,
}

impl<'p> KeySetCache<'p> {
    #[must_use]
    pub fn new(inner: &'p dyn KeySetProvider) -> Self {
        Self {
            inner,
            entries: RefCell::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KeySetProvider for KeySetCache<'_> {
    fn linked_keys(&self, relation: &PivotRelation, source_key: &Key) -> Result<Vec<Key>> {
        let cache_key = CacheKey::new(relation, source_key);
        if let Some(hit) = self.entries.borrow().get(&cache_key) {
            return Ok(hit.clone());
        }
        let keys = self.inner.linked_keys(relation, source_key)?;
        self.entries.borrow_mut().insert(cache_key, keys.clone());
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Applies a configuration's strategy to source snapshots.
#[derive(Clone, Copy)]
pub struct KeyResolver<'p> {
    provider: &'p dyn KeySetProvider,
}

impl<'p> KeyResolver<'p> {
    #[must_use]
    pub const fn new(provider: &'p dyn KeySetProvider) -> Self {
        Self { provider }
    }

    /// True when `strategy` deliberately resolves nothing for `mutation`.
    ///
    /// Pivot associations are maintained by the host when the pivot rows
    /// themselves change, so creating or updating the source row does not
    /// touch the pivot's targets.
    #[must_use]
    pub const fn skips(strategy: &ForeignKeyStrategy, mutation: Mutation) -> bool {
        matches!(strategy, ForeignKeyStrategy::ThroughPivot(_))
            && matches!(mutation, Mutation::Created | Mutation::Updated)
    }

    /// Extract the deduplicated target keys for one raw foreign-key value.
    ///
    /// # Errors
    ///
    /// Returns an error if a pivot lookup fails.
    pub fn extract_target_keys(
        &self,
        strategy: &ForeignKeyStrategy,
        raw: &Value,
        mutation: Mutation,
    ) -> Result<Vec<Key>> {
        if Self::skips(strategy, mutation) {
            return Ok(Vec::new());
        }
        let keys = match strategy {
            ForeignKeyStrategy::Direct => Key::from_value(raw).into_iter().collect(),
            ForeignKeyStrategy::Path { separator } => match raw {
                Value::Text(path) => path
                    .split(separator.as_str())
                    .filter_map(Key::parse)
                    .collect(),
                other => Key::from_value(other).into_iter().collect(),
            },
            ForeignKeyStrategy::ThroughPivot(relation) => match Key::from_value(raw) {
                Some(source_key) => self.provider.linked_keys(relation, &source_key)?,
                None => Vec::new(),
            },
        };
        Ok(dedup(keys))
    }

    /// Resolve the targets a snapshot contributes to.
    ///
    /// When `required` is set and a direct or path key resolves nothing, the
    /// row would be orphaned: that is an [`CacheError::UnresolvableTarget`]
    /// unless the configuration ignores empty foreign keys. A pivot source
    /// without association rows is simply unlinked.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails or the row is orphaned.
    pub fn resolve(
        &self,
        config: &CacheConfiguration,
        snapshot: &Snapshot,
        mutation: Mutation,
        required: bool,
    ) -> Result<Vec<Key>> {
        let raw = snapshot.value(&config.foreign_key_field);
        let keys = self.extract_target_keys(&config.strategy, &raw, mutation)?;
        if required
            && keys.is_empty()
            && !config.flags.ignore_empty_foreign_keys
            && !matches!(config.strategy, ForeignKeyStrategy::ThroughPivot(_))
        {
            return Err(CacheError::UnresolvableTarget {
                model: config.target_model.clone(),
                field: config.foreign_key_field.clone(),
            });
        }
        Ok(keys)
    }
}

fn dedup(keys: Vec<Key>) -> Vec<Key> {
    let mut seen = BTreeSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ConfigId};
    use std::cell::Cell;

    struct FixedKeys {
        keys: Vec<Key>,
        calls: Cell<usize>,
    }

    impl KeySetProvider for FixedKeys {
        fn linked_keys(&self, _relation: &PivotRelation, _source_key: &Key) -> Result<Vec<Key>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.keys.clone())
        }
    }

    fn no_pivots() -> FixedKeys {
        FixedKeys {
            keys: Vec::new(),
            calls: Cell::new(0),
        }
    }

    fn pivot_config() -> CacheConfiguration {
        CacheConfig::count("posts", "id", "tags", "post_count")
            .through_pivot("taggables", "taggable_id", "tag_id")
            .discriminator("taggable_type", "post")
            .normalize(ConfigId(0))
            .expect("normalize")
    }

    #[test]
    fn direct_strategy_yields_single_key() {
        let provider = no_pivots();
        let resolver = KeyResolver::new(&provider);
        let keys = resolver
            .extract_target_keys(&ForeignKeyStrategy::Direct, &Value::from("42"), Mutation::Created)
            .expect("keys");
        assert_eq!(keys, vec![Key::Integer(42)]);

        let none = resolver
            .extract_target_keys(&ForeignKeyStrategy::Direct, &Value::Null, Mutation::Created)
            .expect("keys");
        assert!(none.is_empty());
    }

    #[test]
    fn path_strategy_splits_and_dedups() {
        let provider = no_pivots();
        let resolver = KeyResolver::new(&provider);
        let strategy = ForeignKeyStrategy::Path {
            separator: "/".into(),
        };
        let keys = resolver
            .extract_target_keys(&strategy, &Value::from("/1/4//9/4/"), Mutation::Updated)
            .expect("keys");
        assert_eq!(keys, vec![Key::Integer(1), Key::Integer(4), Key::Integer(9)]);
    }

    #[test]
    fn pivot_strategy_skips_created_and_updated() {
        let provider = FixedKeys {
            keys: vec![Key::Integer(1), Key::Integer(2)],
            calls: Cell::new(0),
        };
        let resolver = KeyResolver::new(&provider);
        let config = pivot_config();
        let raw = Value::Integer(10);

        for mutation in [Mutation::Created, Mutation::Updated] {
            let keys = resolver
                .extract_target_keys(&config.strategy, &raw, mutation)
                .expect("keys");
            assert!(keys.is_empty());
        }
        assert_eq!(provider.calls.get(), 0);

        let deleted = resolver
            .extract_target_keys(&config.strategy, &raw, Mutation::Deleted)
            .expect("keys");
        assert_eq!(deleted, vec![Key::Integer(1), Key::Integer(2)]);
    }

    #[test]
    fn empty_direct_key_is_unresolvable_unless_ignored() {
        let provider = no_pivots();
        let resolver = KeyResolver::new(&provider);
        let strict = CacheConfig::count("items", "order_id", "orders", "n")
            .normalize(ConfigId(0))
            .expect("normalize");
        let lenient = CacheConfig::count("items", "order_id", "orders", "n")
            .ignore_empty_foreign_keys()
            .normalize(ConfigId(1))
            .expect("normalize");
        let orphan = Snapshot::new().with("order_id", Value::Null);

        let err = resolver
            .resolve(&strict, &orphan, Mutation::Created, true)
            .unwrap_err();
        assert!(matches!(err, CacheError::UnresolvableTarget { .. }), "{err}");

        let keys = resolver
            .resolve(&lenient, &orphan, Mutation::Created, true)
            .expect("ignored");
        assert!(keys.is_empty());
    }

    #[test]
    fn cache_memoizes_per_source_key() {
        let provider = FixedKeys {
            keys: vec![Key::Integer(3)],
            calls: Cell::new(0),
        };
        let cache = KeySetCache::new(&provider);
        let ForeignKeyStrategy::ThroughPivot(relation) = pivot_config().strategy else {
            panic!("expected pivot");
        };

        for _ in 0..3 {
            let keys = cache.linked_keys(&relation, &Key::Integer(10)).expect("keys");
            assert_eq!(keys, vec![Key::Integer(3)]);
        }
        cache.linked_keys(&relation, &Key::Integer(11)).expect("keys");
        assert_eq!(provider.calls.get(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_separates_relations_sharing_a_table() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE memberships (club_id INTEGER, member_id INTEGER, sponsor_id INTEGER);
             INSERT INTO memberships VALUES (1, 7, NULL), (2, NULL, 7), (3, 7, 7);",
        )
        .expect("seed");
        let provider = SqlKeySetProvider::new(&conn);
        let cache = KeySetCache::new(&provider);
        let relation = |source: &str| PivotRelation {
            table: "memberships".into(),
            source_column: source.into(),
            target_column: "club_id".into(),
            discriminator: None,
        };

        let members = cache
            .linked_keys(&relation("member_id"), &Key::Integer(7))
            .expect("members");
        let sponsors = cache
            .linked_keys(&relation("sponsor_id"), &Key::Integer(7))
            .expect("sponsors");
        assert_eq!(members, vec![Key::Integer(1), Key::Integer(3)]);
        assert_eq!(sponsors, vec![Key::Integer(2), Key::Integer(3)]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn sql_provider_filters_by_discriminator() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE taggables (tag_id INTEGER, taggable_id INTEGER, taggable_type TEXT);
             INSERT INTO taggables VALUES (1, 10, 'post'), (2, 10, 'post'), (3, 10, 'video'),
                                          (2, 10, 'post'), (4, 11, 'post');",
        )
        .expect("seed");
        let provider = SqlKeySetProvider::new(&conn);
        let ForeignKeyStrategy::ThroughPivot(relation) = pivot_config().strategy else {
            panic!("expected pivot");
        };
        let keys = provider
            .linked_keys(&relation, &Key::Integer(10))
            .expect("keys");
        assert_eq!(keys, vec![Key::Integer(1), Key::Integer(2)]);
    }
}
