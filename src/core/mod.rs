//! Error taxonomy, metrics and readiness shared across pingbff.

pub mod error;
pub mod metrics;
pub mod status;

pub use error::{AggregationError, CallError};
