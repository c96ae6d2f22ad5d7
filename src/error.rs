//! Error kinds for job execution.
//!
//! Every iteration of the processor loop is a crash domain: exceptions
//! never cross the loop boundary. This module defines the distinguishable
//! error kinds that flow through middleware, the retry/death engine, and
//! the processor, plus the cause-chain walk used to recognize a shutdown
//! marker buried inside an arbitrary error chain.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

/// An error raised by handler or middleware code. Carries enough structure
/// for the retry engine to populate `error_class`/`error_message`/backtrace
/// without re-parsing a `Display` string.
#[derive(Debug)]
pub struct JobFailure {
    pub class: String,
    pub message: String,
    pub backtrace: Vec<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl JobFailure {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
            source: None,
        }
    }

    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = frames;
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|b| b.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// A marker type injected into a processor's execution to signal hard
/// shutdown. Distinguished only by type identity, never by message.
#[derive(Debug, Error)]
#[error("processor shutdown requested")]
pub struct ShutdownMarker;

/// The error type propagated out of handler/middleware execution.
///
/// `Shutdown` must be checked for *first* wherever this type is matched,
/// ahead of any other classification: a shutdown marker can arrive wrapped
/// inside an otherwise-ordinary failure, and must still short-circuit
/// retry/death handling rather than being retried like a normal error.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Shutdown(#[from] ShutdownMarker),

    #[error(transparent)]
    User(#[from] JobFailure),
}

impl JobError {
    pub fn failure(class: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::User(JobFailure::new(class, message))
    }

    /// Walks the `source()` cause chain looking for a [`ShutdownMarker`],
    /// with cycle protection: each visited error's address is recorded so
    /// a cyclical cause graph cannot loop forever.
    pub fn is_shutdown(&self) -> bool {
        if let JobError::Shutdown(_) = self {
            return true;
        }
        let mut seen: HashSet<usize> = HashSet::new();
        let mut cursor: Option<&(dyn std::error::Error + 'static)> = match self {
            JobError::User(f) => f.source(),
            JobError::Shutdown(_) => return true,
        };
        while let Some(err) = cursor {
            if err.is::<ShutdownMarker>() {
                return true;
            }
            let addr = err as *const dyn std::error::Error as *const () as usize;
            if !seen.insert(addr) {
                break; // cycle detected
            }
            cursor = err.source();
        }
        false
    }
}

/// The outcome of routing a failure through the retry/death engine —
/// sentinel values signaling "do not re-process this exception upstream".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Retry engine already handled the error at the global (unparsed-job)
    /// entry point.
    Handled,
    /// Retry engine already handled the error at the local
    /// (worker-instantiated) entry point.
    Skip,
    /// A shutdown marker was observed; the unit must be left in-flight for
    /// requeue, never acked.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_marker_detected_at_top_level() {
        let err = JobError::Shutdown(ShutdownMarker);
        assert!(err.is_shutdown());
    }

    #[test]
    fn user_failure_without_shutdown_cause_is_not_shutdown() {
        let err = JobError::failure("RuntimeError", "boom");
        assert!(!err.is_shutdown());
    }

    #[test]
    fn shutdown_marker_found_in_cause_chain() {
        let failure = JobFailure::new("Wrapper", "outer").with_source(ShutdownMarker);
        let err = JobError::User(failure);
        assert!(err.is_shutdown());
    }

    #[test]
    fn deep_non_shutdown_chain_terminates() {
        let inner = JobFailure::new("Inner", "innermost");
        let middle = JobFailure::new("Middle", "middle").with_source(inner);
        let outer = JobFailure::new("Outer", "outer").with_source(middle);
        let err = JobError::User(outer);
        assert!(!err.is_shutdown());
    }
}
