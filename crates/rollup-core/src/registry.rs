//! The set of registered aggregate configurations.
//!
//! A [`Registry`] is built once at boot from [`CacheConfig`] declarations,
//! validated as a whole, and then shared read-only. Validation covers what
//! a single declaration cannot check on its own:
//!
//! - configuration names are unique (the deferred log refers to them)
//! - every target model uses one key field
//! - configurations writing the same summary field (fan-in) agree on the
//!   aggregate function, and custom functions never fan in
//! - a summary field read by another configuration comes from a
//!   configuration with `propagate` set
//! - the propagation graph is acyclic; its longest chain bounds the
//!   propagation worklist at runtime

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::{Aggregate, CacheConfig, CacheConfiguration, ConfigId};
use crate::error::{CacheError, Result};

/// Validated, immutable configuration set with lookup indices.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    configurations: Vec<CacheConfiguration>,
    by_name: HashMap<String, ConfigId>,
    by_source: HashMap<String, Vec<ConfigId>>,
    by_target: HashMap<String, Vec<ConfigId>>,
    max_chain_depth: usize,
}

/// Accumulates declarations before validation.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    declarations: Vec<CacheConfig>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, config: CacheConfig) -> Self {
        self.declarations.push(config);
        self
    }

    /// Validate every declaration and build the registry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidRelation`] or
    /// [`CacheError::UnsupportedAggregation`] naming the first offending
    /// configuration.
    pub fn build(self) -> Result<Registry> {
        Registry::from_configs(self.declarations)
    }
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Normalize and validate a full set of declarations.
    ///
    /// # Errors
    ///
    /// See [`RegistryBuilder::build`].
    pub fn from_configs(declarations: impl IntoIterator<Item = CacheConfig>) -> Result<Self> {
        let configurations = declarations
            .into_iter()
            .enumerate()
            .map(|(idx, decl)| decl.normalize(ConfigId(idx)))
            .collect::<Result<Vec<_>>>()?;

        let mut registry = Self {
            configurations,
            ..Self::default()
        };

        for config in &registry.configurations {
            if registry
                .by_name
                .insert(config.name.clone(), config.id)
                .is_some()
            {
                return Err(CacheError::invalid_relation(
                    &config.name,
                    "configuration name registered twice",
                ));
            }
            registry
                .by_source
                .entry(config.source_model.clone())
                .or_default()
                .push(config.id);
            registry
                .by_target
                .entry(config.target_model.clone())
                .or_default()
                .push(config.id);
        }

        registry.check_key_fields()?;
        registry.check_fan_in()?;
        registry.check_propagation_inputs()?;
        registry.max_chain_depth = registry.chain_depth()?;

        tracing::debug!(
            configurations = registry.configurations.len(),
            max_chain_depth = registry.max_chain_depth,
            "aggregate registry built"
        );
        Ok(registry)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: ConfigId) -> Option<&CacheConfiguration> {
        self.configurations.get(id.0)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&CacheConfiguration> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheConfiguration> {
        self.configurations.iter()
    }

    /// Configurations whose source is `model`, in registration order.
    pub fn for_source<'a>(&'a self, model: &str) -> impl Iterator<Item = &'a CacheConfiguration> {
        self.ids(&self.by_source, model)
    }

    /// Configurations writing into `model`, in registration order.
    pub fn for_target<'a>(&'a self, model: &str) -> impl Iterator<Item = &'a CacheConfiguration> {
        self.ids(&self.by_target, model)
    }

    /// Configurations writing exactly `model.summary_field`.
    pub fn writing<'a>(
        &'a self,
        model: &'a str,
        summary_field: &'a str,
    ) -> impl Iterator<Item = &'a CacheConfiguration> {
        self.for_target(model)
            .filter(move |c| c.summary_field == summary_field)
    }

    /// Distinct summary fields of `model`, in first-registration order.
    #[must_use]
    pub fn summary_fields(&self, model: &str) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.for_target(model)
            .map(|c| c.summary_field.as_str())
            .filter(|f| seen.insert(*f))
            .collect()
    }

    /// Summary fields of `model` that are not hidden by every writer.
    #[must_use]
    pub fn visible_summary_fields(&self, model: &str) -> Vec<&str> {
        self.summary_fields(model)
            .into_iter()
            .filter(|field| self.writing(model, field).any(|c| !c.flags.hidden))
            .collect()
    }

    /// Key field of a target model, if anything targets it.
    #[must_use]
    pub fn key_field(&self, model: &str) -> Option<&str> {
        self.for_target(model).next().map(|c| c.key_field.as_str())
    }

    /// Models that are the target of at least one configuration.
    #[must_use]
    pub fn target_models(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.configurations
            .iter()
            .map(|c| c.target_model.as_str())
            .filter(|m| seen.insert(*m))
            .collect()
    }

    /// Longest propagation chain, in levels. One level means no
    /// configuration propagates into another.
    #[must_use]
    pub const fn max_chain_depth(&self) -> usize {
        self.max_chain_depth
    }

    fn ids<'a>(
        &'a self,
        index: &'a HashMap<String, Vec<ConfigId>>,
        model: &str,
    ) -> impl Iterator<Item = &'a CacheConfiguration> {
        index
            .get(model)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(*id))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn check_key_fields(&self) -> Result<()> {
        for config in &self.configurations {
            if let Some(first) = self.for_target(&config.target_model).next()
                && first.key_field != config.key_field
            {
                return Err(CacheError::invalid_relation(
                    &config.name,
                    format!(
                        "target {} is keyed by '{}' in {} but by '{}' here",
                        config.target_model, first.key_field, first.name, config.key_field
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_fan_in(&self) -> Result<()> {
        let mut groups: BTreeMap<(&str, &str), Vec<&CacheConfiguration>> = BTreeMap::new();
        for config in &self.configurations {
            groups
                .entry((&config.target_model, &config.summary_field))
                .or_default()
                .push(config);
        }

        for ((model, field), writers) in groups {
            let [first, rest @ ..] = writers.as_slice() else {
                continue;
            };
            for other in rest {
                if matches!(first.aggregate, Aggregate::Custom(_))
                    || matches!(other.aggregate, Aggregate::Custom(_))
                {
                    return Err(CacheError::unsupported(
                        &other.name,
                        format!(
                            "custom aggregates cannot share {model}.{field} with {}",
                            first.name
                        ),
                    ));
                }
                if first.aggregate != other.aggregate {
                    return Err(CacheError::unsupported(
                        &other.name,
                        format!(
                            "{model}.{field} is already maintained as {} by {}",
                            first.aggregate, first.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// A configuration reading another configuration's summary field needs
    /// that writer to propagate, or it would never see the change.
    fn check_propagation_inputs(&self) -> Result<()> {
        for reader in &self.configurations {
            for attribute in reader.source_attributes() {
                if let Some(writer) = self
                    .writing(&reader.source_model, attribute)
                    .find(|w| !w.flags.propagate)
                {
                    return Err(CacheError::invalid_relation(
                        &reader.name,
                        format!(
                            "reads {}.{attribute}, which {} maintains without propagate",
                            reader.source_model, writer.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Longest path through the propagation graph, rejecting cycles.
    ///
    /// Edges run from a propagating configuration to every configuration
    /// whose source is its target model.
    fn chain_depth(&self) -> Result<usize> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            Active,
            Done(usize),
        }

        fn visit(
            registry: &Registry,
            id: ConfigId,
            marks: &mut [Mark],
            path: &mut Vec<ConfigId>,
        ) -> Result<usize> {
            match marks[id.0] {
                Mark::Done(depth) => return Ok(depth),
                Mark::Active => {
                    let cycle = path
                        .iter()
                        .skip_while(|p| **p != id)
                        .chain(std::iter::once(&id))
                        .filter_map(|p| registry.get(*p).map(|c| c.name.as_str()))
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    let name = registry.get(id).map_or("", |c| c.name.as_str());
                    return Err(CacheError::invalid_relation(
                        name,
                        format!("cyclic propagation chain: {cycle}"),
                    ));
                }
                Mark::Unvisited => {}
            }

            marks[id.0] = Mark::Active;
            path.push(id);
            let mut below = 0;
            if let Some(config) = registry.get(id)
                && config.flags.propagate
            {
                let children: Vec<ConfigId> = registry
                    .for_source(&config.target_model)
                    .map(|c| c.id)
                    .collect();
                for child in children {
                    below = below.max(visit(registry, child, marks, path)?);
                }
            }
            path.pop();

            let depth = below + 1;
            marks[id.0] = Mark::Done(depth);
            Ok(depth)
        }

        let mut marks = vec![Mark::Unvisited; self.configurations.len()];
        let mut path = Vec::new();
        let mut deepest = 0;
        for config in &self.configurations {
            deepest = deepest.max(visit(self, config.id, &mut marks, &mut path)?);
        }
        Ok(deepest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_registry() -> Registry {
        Registry::builder()
            .register(CacheConfig::count("items", "order_id", "orders", "item_count"))
            .register(CacheConfig::sum("items", "total", "order_id", "orders", "item_total"))
            .register(
                CacheConfig::count("items", "order_id", "orders", "audit_count")
                    .hidden()
                    .named("audit"),
            )
            .build()
            .expect("registry")
    }

    #[test]
    fn indexes_by_source_and_target() {
        let registry = orders_registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.for_source("items").count(), 3);
        assert_eq!(registry.for_target("orders").count(), 3);
        assert_eq!(registry.for_source("orders").count(), 0);
        assert_eq!(registry.key_field("orders"), Some("id"));
        assert!(registry.by_name("audit").is_some());
    }

    #[test]
    fn hidden_fields_are_not_visible() {
        let registry = orders_registry();
        assert_eq!(
            registry.summary_fields("orders"),
            vec!["item_count", "item_total", "audit_count"]
        );
        assert_eq!(
            registry.visible_summary_fields("orders"),
            vec!["item_count", "item_total"]
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Registry::builder()
            .register(CacheConfig::count("items", "order_id", "orders", "a").named("x"))
            .register(CacheConfig::count("items", "order_id", "orders", "b").named("x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidRelation { .. }), "{err}");
    }

    #[test]
    fn fan_in_with_mixed_functions_is_rejected() {
        let err = Registry::builder()
            .register(CacheConfig::sum("items", "total", "order_id", "orders", "total"))
            .register(CacheConfig::max("refunds", "amount", "order_id", "orders", "total"))
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedAggregation { .. }), "{err}");
    }

    #[test]
    fn fan_in_of_same_function_is_accepted() {
        let registry = Registry::builder()
            .register(CacheConfig::count("comments", "post_id", "posts", "activity"))
            .register(CacheConfig::count("likes", "post_id", "posts", "activity"))
            .build()
            .expect("registry");
        assert_eq!(registry.writing("posts", "activity").count(), 2);
        assert_eq!(registry.summary_fields("posts"), vec!["activity"]);
    }

    #[test]
    fn custom_fan_in_is_rejected() {
        let err = Registry::builder()
            .register(CacheConfig::custom(
                "group_concat",
                "items",
                "sku",
                "order_id",
                "orders",
                "skus",
            ))
            .register(CacheConfig::custom(
                "group_concat",
                "extras",
                "sku",
                "order_id",
                "orders",
                "skus",
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedAggregation { .. }), "{err}");
    }

    #[test]
    fn reading_unpropagated_summary_is_rejected() {
        let err = Registry::builder()
            .register(CacheConfig::sum("items", "total", "order_id", "orders", "total"))
            .register(CacheConfig::sum("orders", "total", "customer_id", "customers", "spent"))
            .build()
            .unwrap_err();
        let CacheError::InvalidRelation { reason, .. } = err else {
            panic!("expected invalid relation");
        };
        assert!(reason.contains("orders.total"), "{reason}");
    }

    #[test]
    fn chain_depth_counts_propagation_levels() {
        let registry = Registry::builder()
            .register(CacheConfig::sum("items", "total", "order_id", "orders", "total").propagate())
            .register(
                CacheConfig::sum("orders", "total", "customer_id", "customers", "spent")
                    .propagate(),
            )
            .register(CacheConfig::sum("customers", "spent", "region_id", "regions", "revenue"))
            .register(CacheConfig::count("items", "order_id", "orders", "lines"))
            .build()
            .expect("registry");
        assert_eq!(registry.max_chain_depth(), 3);
    }

    #[test]
    fn propagation_cycles_are_rejected() {
        let err = Registry::builder()
            .register(CacheConfig::count("a", "b_id", "b", "n").propagate())
            .register(CacheConfig::count("b", "a_id", "a", "n").propagate())
            .build()
            .unwrap_err();
        let CacheError::InvalidRelation { reason, .. } = err else {
            panic!("expected invalid relation");
        };
        assert!(reason.contains("cyclic"), "{reason}");
    }

    #[test]
    fn mismatched_key_fields_are_rejected() {
        let err = Registry::builder()
            .register(CacheConfig::count("items", "order_id", "orders", "n"))
            .register(CacheConfig::count("notes", "order_ref", "orders", "m").key_field("uuid"))
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidRelation { .. }), "{err}");
    }
}
