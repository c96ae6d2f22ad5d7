//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total jobs processed, labeled by outcome (`success`/`retry`/`dead`) and
/// queue.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of pending entries per live queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed across all processors.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Total retries scheduled, labeled by queue.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total jobs moved to the dead set, labeled by queue.
pub static DEAD_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of active processors across the fleet.
pub static ACTIVE_PROCESSORS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. It creates all
/// metric instances with appropriate labels and buckets, and registers them
/// with the global Prometheus registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("jobforge_jobs_total", "Total jobs processed"),
        &["status", "queue"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "jobforge_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("jobforge_queue_depth", "Number of pending entries in a queue"),
        &["queue"],
    )?;

    let jobs_in_progress = Gauge::new(
        "jobforge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let retries_total = CounterVec::new(
        Opts::new("jobforge_retries_total", "Total retries scheduled"),
        &["queue"],
    )?;

    let dead_total = CounterVec::new(
        Opts::new("jobforge_dead_total", "Total jobs moved to the dead set"),
        &["queue"],
    )?;

    let active_processors = Gauge::new(
        "jobforge_active_processors",
        "Number of active processors across the fleet",
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(dead_total.clone()))?;
    registry.register(Box::new(active_processors.clone()))?;

    // Idempotent: if already initialized, these `set` calls simply no-op.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = DEAD_TOTAL.set(dead_total);
    let _ = ACTIVE_PROCESSORS.set(active_processors);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the `/metrics` endpoint, left generic over the web
/// framework — mounting an HTTP server is outside this core's scope (the
/// admin console is an external collaborator), but the hook exists so an
/// external binary can mount it directly.
///
/// ```ignore
/// use axum::{routing::get, Router};
/// use jobforge::metrics::metrics_handler;
///
/// let app = Router::new()
///     .route("/metrics", get(|| async { metrics_handler().await }));
/// ```
pub async fn metrics_handler() -> String {
    export_metrics()
}
