//! rollup-core: incremental maintenance of aggregate summary columns.
//!
//! Hosts declare aggregates (`count`, `sum`, `min`, `max`, or a
//! recompute-only SQL aggregate) from a source table into a summary column
//! of a target table, then report every source mutation to
//! [`engine::Engine::handle`] inside the mutating transaction. Summaries are
//! kept equal to what a full recompute would produce.
//!
//! # Conventions
//!
//! - **Errors**: library functions return [`error::Result`]; file loading in
//!   [`settings`] and [`db::open_store`] returns `anyhow::Result`.
//! - **Logging**: `tracing` macros with structured fields; the library never
//!   installs a subscriber.

pub mod config;
pub mod db;
pub mod delta;
pub mod engine;
pub mod error;
pub mod executor;
pub mod log;
pub mod recompute;
pub mod record;
pub mod registry;
pub mod relevance;
pub mod resolve;
pub mod settings;
pub mod value;

pub use config::{Aggregate, CacheConfig, CacheConfiguration};
pub use engine::Engine;
pub use error::{CacheError, ErrorCode, Result};
pub use record::{Mutation, Snapshot, SourceEvent, SourceRecord};
pub use registry::Registry;
pub use value::{Key, Value};
