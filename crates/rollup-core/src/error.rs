use std::fmt;

/// Machine-readable error codes for operator tooling and log scraping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MissingAttribute,
    UnresolvableTarget,
    InvalidRelation,
    UnsupportedAggregation,
    PropagationDepthExceeded,
    SnapshotEncoding,
    StorageBusy,
    StorageFailure,
}

impl ErrorCode {
    /// Stable code identifier (`R####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::MissingAttribute => "R1001",
            Self::UnresolvableTarget => "R1002",
            Self::InvalidRelation => "R2001",
            Self::UnsupportedAggregation => "R2002",
            Self::PropagationDepthExceeded => "R3001",
            Self::SnapshotEncoding => "R3002",
            Self::StorageBusy => "R5001",
            Self::StorageFailure => "R5002",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::MissingAttribute => "Relevance attribute missing from snapshot",
            Self::UnresolvableTarget => "No target record resolved for source record",
            Self::InvalidRelation => "Invalid aggregate relation",
            Self::UnsupportedAggregation => "Unsupported aggregation",
            Self::PropagationDepthExceeded => "Propagation chain deeper than registered",
            Self::SnapshotEncoding => "Snapshot encoding failed",
            Self::StorageBusy => "Storage busy",
            Self::StorageFailure => "Storage failure",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::MissingAttribute => {
                Some("Load every attribute named in the aggregate's where conditions.")
            }
            Self::UnresolvableTarget => Some(
                "Set the foreign key before saving, or enable ignore_empty_foreign_keys.",
            ),
            Self::InvalidRelation => Some("Fix the aggregate declaration and restart."),
            Self::UnsupportedAggregation => {
                Some("Use count, sum, min, max, or a recompute-only custom function.")
            }
            Self::PropagationDepthExceeded => {
                Some("Report a bug: the registry accepted a cyclic propagation chain.")
            }
            Self::SnapshotEncoding => None,
            Self::StorageBusy => Some("Retry after the competing writer commits."),
            Self::StorageFailure => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Every failure the cache engine can surface.
///
/// Configuration-shaped errors (`InvalidRelation`, `UnsupportedAggregation`)
/// are produced by the registry at boot. `MissingAttribute` and
/// `UnresolvableTarget` indicate caller bugs and are never retried. Storage
/// errors propagate to the enclosing transaction untouched.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(
        "attribute '{field}' is required to evaluate {aggregate} into '{summary_field}' but is missing from the current snapshot"
    )]
    MissingAttribute {
        field: String,
        aggregate: String,
        summary_field: String,
    },

    #[error("no {model} record resolved from foreign key '{field}'")]
    UnresolvableTarget { model: String, field: String },

    #[error("invalid relation in aggregate {configuration}: {reason}")]
    InvalidRelation {
        configuration: String,
        reason: String,
    },

    #[error("unsupported aggregation in {configuration}: {reason}")]
    UnsupportedAggregation {
        configuration: String,
        reason: String,
    },

    #[error("propagation exceeded registered chain depth {depth}")]
    PropagationDepthExceeded { depth: usize },

    #[error("snapshot encoding: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl CacheError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingAttribute { .. } => ErrorCode::MissingAttribute,
            Self::UnresolvableTarget { .. } => ErrorCode::UnresolvableTarget,
            Self::InvalidRelation { .. } => ErrorCode::InvalidRelation,
            Self::UnsupportedAggregation { .. } => ErrorCode::UnsupportedAggregation,
            Self::PropagationDepthExceeded { .. } => ErrorCode::PropagationDepthExceeded,
            Self::Snapshot(_) => ErrorCode::SnapshotEncoding,
            Self::Storage(err) => {
                if is_busy(err) {
                    ErrorCode::StorageBusy
                } else {
                    ErrorCode::StorageFailure
                }
            }
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// True when retrying the same work later may succeed.
    ///
    /// Only lock contention qualifies; constraint violations and every
    /// configuration error are permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(err) if is_busy(err))
    }

    pub(crate) fn invalid_relation(configuration: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRelation {
            configuration: configuration.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(configuration: &str, reason: impl Into<String>) -> Self {
        Self::UnsupportedAggregation {
            configuration: configuration.to_string(),
            reason: reason.into(),
        }
    }
}

const fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _
        )
    )
}

/// Result alias used across the engine.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
