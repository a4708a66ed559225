//! Observability: structured logging and Prometheus metrics.
//!
//! Metric recording functions are always available and compile to no-ops
//! without the `prometheus` feature. Subscriber setup needs `server`.

pub mod metrics;
#[cfg(feature = "server")]
mod tracing_init;

#[cfg(feature = "server")]
pub use tracing_init::*;
