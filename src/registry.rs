//! Explicit handler registry: job class name → handler factory.
//!
//! Populated at startup; unknown class names raise a typed error that
//! flows through the normal retry/death engine rather than panicking.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::JobError;

/// A job handler: the terminal action a middleware chain invokes.
/// `perform` receives the job's positional arguments and runs to
/// completion or returns an error, which the retry/death engine classifies.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn perform(&self, args: Vec<Value>) -> Result<(), JobError>;

    /// Declared retry policy consulted only when the envelope carries no
    /// explicit `retry` field. `None` means "fall back to the
    /// registry-wide default".
    fn default_max_attempts(&self) -> Option<u32> {
        None
    }

    /// Optional custom delay override. Returning `None` falls through to
    /// the default delay formula.
    fn retry_in(&self, _count: u32, _error: &JobError) -> Option<i64> {
        None
    }

    /// Called once, right before a job is moved to the dead set. Errors
    /// inside this hook are the caller's concern to isolate; the engine
    /// only guarantees it cannot affect the retry/death decision itself.
    fn retries_exhausted(&self, _job: &crate::envelope::Job, _error: &JobError) {}
}

/// Produces a fresh [`Handler`] instance per job.
pub trait HandlerFactory: Send + Sync {
    fn build(&self) -> Arc<dyn Handler>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown handler: {0}")]
    UnknownHandler(String),
}

/// Maps a job's `class` field to the factory that builds its handler.
/// Populated once at startup, read-only thereafter.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: impl Into<String>, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(class.into(), factory);
    }

    /// Instantiates the handler registered for `class`, or an "unknown
    /// handler" error if none is registered.
    pub fn build(&self, class: &str) -> Result<Arc<dyn Handler>, RegistryError> {
        self.factories
            .get(class)
            .map(|f| f.build())
            .ok_or_else(|| RegistryError::UnknownHandler(class.to_string()))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
