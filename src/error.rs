use std::sync::Arc;

use thiserror::Error;

/// Result type used by configuration-time operations of the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `splitkit`.
///
/// Evaluation (`get_variant()`, `is_feature_enabled()`, etc.) never fails. Errors are only
/// returned when configuring experiments or flags, or when a storage backend / sink cannot be
/// constructed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Experiment definition violates one of the configuration invariants.
    #[error("invalid experiment configuration: {0}")]
    InvalidExperiment(#[source] ValidationError),

    /// Feature flag definition violates one of the configuration invariants.
    #[error("invalid feature flag configuration: {0}")]
    InvalidFlag(#[source] ValidationError),

    /// An experiment with the same id already exists.
    #[error("experiment {0:?} already exists")]
    DuplicateExperiment(String),

    /// A feature flag with the same id already exists.
    #[error("feature flag {0:?} already exists")]
    DuplicateFlag(String),

    /// The requested experiment does not exist.
    #[error("experiment {0:?} not found")]
    ExperimentNotFound(String),

    /// The requested feature flag does not exist.
    #[error("feature flag {0:?} not found")]
    FlagNotFound(String),

    /// Invalid base URL for the analytics endpoint.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    /// An I/O error from a storage backend.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Stored value could not be (de)serialized.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

/// Describes which configuration invariant was violated.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Id must not be empty.
    #[error("id must not be empty")]
    EmptyId,

    /// At least one variant is required.
    #[error("at least one variant is required")]
    NoVariants,

    /// Two variants share the same id.
    #[error("duplicate variant id {0:?}")]
    DuplicateVariant(String),

    /// A single variant allocation is outside of 0..=100.
    #[error("variant {variant:?} allocation {allocation} is outside of 0..=100")]
    VariantAllocationOutOfRange {
        /// Offending variant id.
        variant: String,
        /// Its allocation.
        allocation: f64,
    },

    /// Variant allocations do not add up to 100.
    #[error("variant allocations must sum to 100 (found {0})")]
    AllocationSum(f64),

    /// None of the variants is marked as control.
    #[error("at least one variant must be marked as control")]
    NoControlVariant,

    /// A percentage (traffic allocation or rollout) is outside of 0..=100.
    #[error("{field} {value} is outside of 0..=100")]
    PercentageOutOfRange {
        /// Field name.
        field: &'static str,
        /// Its value.
        value: f64,
    },

    /// `start_date` is after `end_date`.
    #[error("start date is after end date")]
    InvalidSchedule,
}
