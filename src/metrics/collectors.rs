//! Custom metric collector for jobforge operations.
//!
//! This module provides a high-level interface for recording job-queue
//! metrics throughout the application. `MetricsCollector` wraps the raw
//! Prometheus metrics and provides convenient methods for common
//! operations, called from the processor loop, retry engine, and poller.

use super::prometheus::{
    ACTIVE_PROCESSORS, DEAD_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH,
    RETRIES_TOTAL,
};

/// Metrics collector for recording jobforge operational metrics.
///
/// Note: metrics must be initialized with `init_metrics()` before calling
/// any recording methods; every method here degrades to a no-op (plus a
/// trace log) if that hasn't happened yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a successfully completed job.
    pub fn record_success(&self, queue: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&["success", queue]).inc();
        }
        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.with_label_values(&[queue]).observe(duration_secs);
        }
        tracing::trace!(queue = queue, duration_secs = duration_secs, "job succeeded");
    }

    /// Records a job sent to the retry set.
    pub fn record_retry(&self, queue: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&["retry", queue]).inc();
        }
        if let Some(retries_total) = RETRIES_TOTAL.get() {
            retries_total.with_label_values(&[queue]).inc();
        }
        tracing::trace!(queue = queue, "job scheduled for retry");
    }

    /// Records a job moved to the dead set.
    pub fn record_dead(&self, queue: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&["dead", queue]).inc();
        }
        if let Some(dead_total) = DEAD_TOTAL.get() {
            dead_total.with_label_values(&[queue]).inc();
        }
        tracing::trace!(queue = queue, "job moved to dead set");
    }

    /// Updates the pending-entry gauge for a queue.
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
        tracing::trace!(queue = queue, depth = depth, "updated queue depth");
    }

    /// Updates the count of jobs currently being processed.
    pub fn update_jobs_in_progress(&self, count: usize) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.set(count as f64);
        }
        tracing::trace!(count = count, "updated jobs in progress");
    }

    /// Updates the count of active processors across the fleet.
    pub fn update_active_processors(&self, count: usize) {
        if let Some(active_processors) = ACTIVE_PROCESSORS.get() {
            active_processors.set(count as f64);
        }
        tracing::trace!(count = count, "updated active processors");
    }
}
