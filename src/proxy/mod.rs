//! Request aggregation: routing, upstream calls, fault policy, merge.

pub mod aggregate;
pub mod circuit;
pub mod discovery;
pub mod fault;
pub mod normalize;
pub mod plan;
pub mod profile;
pub mod router;
pub mod transport;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::{AggregatedResponse, AggregationEngine};
pub use fault::FaultPolicyController;
pub use router::{BffRouter, InboundRequest};
pub use upstream::UpstreamPool;
