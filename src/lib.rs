//! Experiment assignment, feature flags and analytics for storefronts.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that assigns users to variants of A/B experiments and
//! evaluates feature flags. Each user is described by a [`UserContext`]: a long-lived user id, the
//! current session and attributes (device, browser, country, custom properties) that
//! [`Targeting`] rules are matched against.
//!
//! Bucketing is deterministic: the same user always lands in the same bucket of the same
//! experiment, with no server round-trip. Assignments are additionally persisted, so a user keeps
//! their variant even if the experiment's allocation changes later.
//!
//! Experiment and flag definitions live in a [`Registry`] that writes every change through to a
//! [`KeyValueStorage`] (in memory, on disk, or any custom backend).
//!
//! Assignments, exposures and conversions are recorded as analytics events by the
//! [`EventTracker`](events::EventTracker), which forwards them to the configured
//! [`EventSink`](events::EventSink)s.
//!
//! The [`quiz`] module implements the product-matching quiz scoring.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation never fails: an unknown or misconfigured experiment yields no variant rather than an
//! error. Errors are only returned when creating or editing experiments and flags, and when
//! constructing storage backends or sinks. Storage failures during evaluation are logged, and the
//! engine keeps working with its in-memory state.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages. Consider integrating a `log`-compatible logger implementation for better visibility
//! into assignment decisions.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/simple` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod context;
mod error;
pub mod events;
mod models;
pub mod quiz;
mod registry;
pub mod sharder;
mod storage;
mod targeting;

pub use client::Client;
pub use config::ClientConfig;
pub use context::{
    generate_session_id, generate_user_id, load_or_create_user_id, AttributeValue, Attributes,
    ContextField, Device, PropertyRef, UserContext, USER_ID_KEY,
};
pub use error::{Error, Result, ValidationError};
pub use models::{
    ExperimentAssignment, ExperimentConfig, ExperimentStatus, ExperimentUpdate,
    ExperimentVariant, FeatureFlag, FeatureFlagUpdate, Timestamp, VariantConfig,
    ALLOCATION_TOLERANCE,
};
pub use registry::{Registry, ASSIGNMENTS_KEY, EXPERIMENTS_KEY, FLAGS_KEY};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use targeting::{Operator, RuleValue, Targeting, TargetingRule};
