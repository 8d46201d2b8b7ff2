//! A server-side feature gate and experimentation client.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that evaluates feature gates, dynamic configs,
//! experiments and layers for a [`User`]. Evaluation is local: the client keeps a copy of the
//! project's specifications in memory and refreshes it from a background thread, so no network
//! round trip happens per evaluation.
//!
//! Every evaluation may produce an exposure event describing how the value was derived. Exposures
//! are sampled and deduplicated, then delivered in batches by a second background thread.
//!
//! A [`Client`] can also render a [`ClientInitResponse`], the bulk payload used to bootstrap
//! client-side SDKs for one user.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only construction, initialization and shutdown
//! return them. Evaluation methods never fail: faults are caught, reported through an optional
//! [`ObservabilityClient`], and replaced with a safe default.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `featuregate`
//! target. Consider integrating a `log`-compatible logger implementation for better visibility
//! into SDK operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos/simple` directory of the repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod client_init_response;
mod config;
mod diagnostics;
mod error;
mod error_boundary;
mod persisted;
mod results;
mod sampling;
mod user;
mod value;

pub mod eval;
pub mod events;
pub mod hashing;
pub mod specs;
pub mod sync;

pub use client::{Client, EvaluationOptions, SyncStatus};
pub use client_init_response::{
    ClientInitResponse, ClientInitResponseOptions, ConfigEvaluation, EvaluatedKeys,
    GateEvaluation, LayerEvaluation,
};
pub use config::ClientOptions;
pub use diagnostics::{Diagnostics, Marker, MarkerAction, OutputLogger};
pub use error::{Error, Result};
pub use error_boundary::{ErrorBoundary, ObservabilityClient};
pub use hashing::HashAlgorithm;
pub use persisted::{
    InMemoryPersistentStorage, PersistedValuesCache, PersistentStorage, StickyValues,
    UserPersistedValues,
};
pub use results::{
    DynamicConfig, EvaluationDetails, EvaluationReason, Experiment, FeatureGate, Layer,
};
pub use sampling::{SamplingMode, SamplingStatus};
pub use user::{Attributes, User};
pub use sync::SyncState;
pub use value::DynamicValue;
