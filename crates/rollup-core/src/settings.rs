use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::log::DrainOptions;
use crate::registry::Registry;

/// Engine settings file (`rollup.toml`).
///
/// ```toml
/// [drain]
/// batch_size = 100
/// deadline_ms = 250
///
/// [refresh]
/// chunk_size = 500
///
/// [[aggregate]]
/// function = "count"
/// source = "items"
/// target = "orders"
/// foreign_key = "order_id"
/// summary_field = "item_count"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub drain: DrainSettings,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default, rename = "aggregate")]
    pub aggregates: Vec<CacheConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wall-clock budget for one drain cycle; unbounded when absent.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

const fn default_batch_size() -> usize {
    100
}

const fn default_chunk_size() -> usize {
    500
}

impl DrainSettings {
    /// Options for a drain cycle starting now.
    #[must_use]
    pub fn options(&self) -> DrainOptions {
        DrainOptions {
            batch_size: self.batch_size.max(1),
            deadline: self
                .deadline_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
        }
    }
}

impl Settings {
    /// Validate the declared aggregates into a registry.
    ///
    /// # Errors
    ///
    /// Returns the registry's validation error with the offending
    /// configuration named.
    pub fn build_registry(&self) -> Result<Registry> {
        Registry::from_configs(self.aggregates.iter().cloned())
            .context("invalid aggregate declarations")
    }
}

/// Load settings from `path`, falling back to defaults when it is absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<Settings>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = load_settings(&dir.path().join("rollup.toml")).expect("load");
        assert_eq!(settings.drain.batch_size, 100);
        assert_eq!(settings.drain.deadline_ms, None);
        assert_eq!(settings.refresh.chunk_size, 500);
        assert!(settings.aggregates.is_empty());
    }

    #[test]
    fn settings_file_declares_aggregates() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("rollup.toml");
        std::fs::write(
            &path,
            r#"
[drain]
batch_size = 25
deadline_ms = 200

[[aggregate]]
function = "count"
source = "items"
target = "orders"
foreign_key = "order_id"
summary_field = "item_count"

[[aggregate]]
name = "paid"
function = "sum"
source = "items"
target = "orders"
value_field = "total"
foreign_key = "order_id"
summary_field = "paid_total"
where = [["status", "paid"]]
asynchronous = true
"#,
        )
        .expect("write settings");

        let settings = load_settings(&path).expect("load");
        assert_eq!(settings.drain.batch_size, 25);
        let options = settings.drain.options();
        assert_eq!(options.batch_size, 25);
        assert!(options.deadline.is_some());

        let registry = settings.build_registry().expect("registry");
        assert_eq!(registry.len(), 2);
        let paid = registry.by_name("paid").expect("named configuration");
        assert!(paid.flags.asynchronous);
        assert_eq!(paid.conditions.len(), 1);
    }

    #[test]
    fn unknown_aggregate_keys_are_rejected() {
        let err = toml::from_str::<Settings>(
            r#"
[[aggregate]]
function = "count"
source = "items"
target = "orders"
foreign_key = "order_id"
summary_field = "n"
propogate = true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("propogate"));
    }

    #[test]
    fn invalid_aggregate_fails_registry_build() {
        let settings: Settings = toml::from_str(
            r#"
[[aggregate]]
function = "median"
source = "items"
target = "orders"
value_field = "total"
foreign_key = "order_id"
summary_field = "n"
"#,
        )
        .expect("parse");
        let err = settings.build_registry().unwrap_err();
        assert!(format!("{err:#}").contains("median"));
    }
}
