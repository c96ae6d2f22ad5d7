//! Retry / death engine: decides, given an exception, whether to retry a
//! job (with delay) or move it to the dead set.
//!
//! Exposes a global entry point (job could not be fully parsed into a
//! handler instance) and a local entry point (handler was constructed).
//! Both follow the same classify → consult → update → decide sequence;
//! they differ only in which sentinel outcome they raise and in where the
//! default retry-cap comes from when the envelope is silent.

use std::sync::Arc;

use rand::Rng;

use crate::config::Config;
use crate::datastore::{Datastore, DatastoreError};
use crate::envelope::{compress_backtrace, scrub_error_message, Job, RetryPolicy};
use crate::error::{JobError, Outcome};

#[derive(Debug, thiserror::Error)]
pub enum RetryEngineError {
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),
}

/// Registered, ordered post-mortem callables run after a job lands in the
/// dead set. Each is isolated: a panic from one never prevents the others
/// from running.
pub type DeathHandler = Arc<dyn Fn(&Job) + Send + Sync>;

/// Implements the classify → consult → update → decide sequence against a
/// shared datastore and configuration.
pub struct RetryEngine {
    datastore: Arc<dyn Datastore>,
    config: Config,
    death_handlers: Vec<DeathHandler>,
}

impl RetryEngine {
    pub fn new(datastore: Arc<dyn Datastore>, config: Config) -> Self {
        Self {
            datastore,
            config,
            death_handlers: Vec::new(),
        }
    }

    pub fn with_death_handlers(mut self, handlers: Vec<DeathHandler>) -> Self {
        self.death_handlers = handlers;
        self
    }

    /// Global entry point: the job payload could not be fully parsed into
    /// a handler instance. There is no handler to consult for a declared
    /// retry default or a custom `retry_in`, so the engine's configured
    /// default stands in for both. Returns [`Outcome::Handled`] on success
    /// unless the error chain carries a shutdown marker, in which case the
    /// caller must leave the unit in-flight rather than ack it.
    pub async fn handle_global(
        &self,
        mut job: Job,
        error: &JobError,
    ) -> Result<Outcome, RetryEngineError> {
        if error.is_shutdown() {
            return Ok(Outcome::Shutdown);
        }
        self.process(&mut job, error, None).await?;
        Ok(Outcome::Handled)
    }

    /// Local entry point: the handler was constructed, so its declared
    /// default retry cap and custom `retry_in` hook (if any) are
    /// consulted. Returns [`Outcome::Skip`] on success unless the error
    /// chain carries a shutdown marker.
    pub async fn handle_local(
        &self,
        mut job: Job,
        error: &JobError,
        handler: &dyn crate::registry::Handler,
    ) -> Result<Outcome, RetryEngineError> {
        if error.is_shutdown() {
            return Ok(Outcome::Shutdown);
        }
        self.process(&mut job, error, Some(handler)).await?;
        Ok(Outcome::Skip)
    }

    async fn process(
        &self,
        job: &mut Job,
        error: &JobError,
        handler: Option<&dyn crate::registry::Handler>,
    ) -> Result<(), RetryEngineError> {
        let policy = job.retry_policy();
        let max_attempts = match policy {
            RetryPolicy::Disabled => {
                self.die(job, error, handler).await?;
                return Ok(());
            }
            RetryPolicy::Default => handler
                .and_then(|h| h.default_max_attempts())
                .unwrap_or(self.config.max_retries),
            RetryPolicy::MaxAttempts(n) => n,
        };

        self.update_envelope(job, error);

        let retry_count = job.retry_count.unwrap_or(0);
        if retry_count < max_attempts {
            let delay = self.delay_for(job, error, retry_count, handler);
            let score = now_epoch() + delay as f64;
            let payload = job.dump()?;
            self.datastore
                .zadd("retry", score, payload)
                .await?;
        } else {
            self.die(job, error, handler).await?;
        }
        Ok(())
    }

    /// Mutates the envelope: queue redirect, error fields, timestamps,
    /// retry_count increment, backtrace.
    ///
    /// `retry_count` is `None` until the first failure, at which point it
    /// becomes `Some(0)`; every subsequent failure increments it. The
    /// retry/death decision reads this post-update value, so after N
    /// failures the stored count reads `N-1`.
    fn update_envelope(&self, job: &mut Job, error: &JobError) {
        job.queue = job.effective_retry_queue().to_string();

        let message = error_message(error);
        job.error_message = Some(scrub_error_message(&message));
        job.error_class = Some(error_class(error));

        let now = now_epoch();
        if job.retry_count.is_none() {
            job.failed_at = Some(now);
            job.retry_count = Some(0);
        } else {
            job.retried_at = Some(now);
            job.retry_count = job.retry_count.map(|c| c + 1);
        }

        if let Some(policy) = job.backtrace {
            let frames = error_backtrace(error);
            let limited = match policy.frame_limit() {
                Some(n) => frames.into_iter().take(n).collect::<Vec<_>>(),
                None => frames,
            };
            if let Ok(compressed) = compress_backtrace(&limited) {
                job.error_backtrace = Some(compressed);
            }
        }
    }

    /// Delay formula. `retry_count` here is the post-update value read in
    /// `process`.
    fn delay_for(
        &self,
        job: &Job,
        error: &JobError,
        retry_count: u32,
        handler: Option<&dyn crate::registry::Handler>,
    ) -> i64 {
        let jitter = jitter_for(retry_count);

        if let Some(handler) = handler {
            if let Some(custom) = handler.retry_in(retry_count, error) {
                if custom > 0 {
                    return custom + jitter;
                }
            }
        }

        let _ = job; // retained for signature symmetry with the custom hook's access to job context
        (retry_count as i64).pow(4) + 15 + jitter
    }

    async fn die(
        &self,
        job: &mut Job,
        error: &JobError,
        handler: Option<&dyn crate::registry::Handler>,
    ) -> Result<(), RetryEngineError> {
        if let Some(handler) = handler {
            handler.retries_exhausted(job, error);
        }

        if !job.suppresses_dead_letter() {
            let now = now_epoch();
            let payload = job.dump()?;
            self.datastore
                .dead_letter(
                    payload,
                    now,
                    self.config.dead_max_age.as_secs_f64(),
                    self.config.dead_max_count,
                )
                .await?;
        }

        for death_handler in &self.death_handlers {
            death_handler(job);
        }

        tracing::error!(
            jid = %job.jid,
            class = %job.class,
            error = %error,
            "job exhausted retries, moved to dead set"
        );
        Ok(())
    }
}

fn jitter_for(retry_count: u32) -> i64 {
    let base = rand::rng().random_range(0..10);
    base * (retry_count as i64 + 1)
}

fn error_message(error: &JobError) -> String {
    match error {
        JobError::User(f) => f.message.clone(),
        JobError::Shutdown(_) => "processor shutdown requested".to_string(),
    }
}

fn error_class(error: &JobError) -> String {
    match error {
        JobError::User(f) => f.class.clone(),
        JobError::Shutdown(_) => "ShutdownMarker".to_string(),
    }
}

fn error_backtrace(error: &JobError) -> Vec<String> {
    match error {
        JobError::User(f) => f.backtrace.clone(),
        JobError::Shutdown(_) => Vec::new(),
    }
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
