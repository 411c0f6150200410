//! Optional Prometheus metrics (gated behind the `metrics` feature).

pub mod registry;
pub mod server;

pub use registry::Metrics;
pub use server::start_metrics_server;
