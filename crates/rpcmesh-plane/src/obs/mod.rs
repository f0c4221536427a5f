//! Observability helpers.

pub mod metrics;

pub use metrics::PlaneMetrics;
