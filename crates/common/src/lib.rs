//! Shared configuration, error types, IDs, values, and metrics for DFQ crates.
//!
//! Architecture role:
//! - defines the fetch runtime configuration passed to initiator and node sides
//! - provides the common [`DfqError`] / [`Result`] contracts
//! - hosts typed ids ([`JobId`], [`FetchPhaseId`], [`FetchId`], ...) and row values
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`value`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod value;

pub use config::FetchConfig;
pub use error::{DfqError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
pub use value::{Row, ScalarValue};
