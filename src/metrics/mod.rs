//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job outcomes, queue depth, retry/dead counts, and fleet size.
//! No HTTP server is part of this core; an admin console is an external
//! collaborator, but `metrics_handler` is exposed so one can be mounted
//! externally.
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_success("default", 0.12);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_PROCESSORS, DEAD_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH,
    REGISTRY, RETRIES_TOTAL,
};
