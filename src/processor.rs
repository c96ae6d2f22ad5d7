//! One worker: fetch → run middleware + perform → ack / retry. Reports
//! lifecycle events to its owning manager exactly once per run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::envelope::Job;
use crate::error::{JobError, Outcome};
use crate::fetcher::Fetcher;
use crate::middleware::{Chain, Invocation};
use crate::registry::Registry;
use crate::retry::RetryEngine;

/// Processor lifecycle state: created → running → stopping → stopped, or
/// → died from running/stopping on an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Stopping,
    Stopped,
    Died,
}

/// Event reported to the owning manager exactly once per processor run.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    Stopped { identity: String },
    Died { identity: String, error: String },
}

/// A single worker loop, realized as one tokio task under a
/// multi-threaded runtime.
pub struct Processor {
    identity: String,
    fetcher: Arc<Fetcher>,
    registry: Arc<Registry>,
    middleware: Chain,
    retry_engine: Arc<RetryEngine>,
    events: mpsc::UnboundedSender<ProcessorEvent>,
    stopping: Arc<AtomicBool>,
    state: Arc<Mutex<State>>,
    idle_backoff: std::time::Duration,
    shutdown: broadcast::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: impl Into<String>,
        fetcher: Arc<Fetcher>,
        registry: Arc<Registry>,
        middleware: Chain,
        retry_engine: Arc<RetryEngine>,
        events: mpsc::UnboundedSender<ProcessorEvent>,
        idle_backoff: std::time::Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            identity: identity.into(),
            fetcher,
            registry,
            middleware,
            retry_engine,
            events,
            stopping: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(State::Created)),
            idle_backoff,
            shutdown,
            handle: None,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Spawns the worker loop as a tokio task and transitions to running.
    pub fn start(&mut self) {
        *self.state.lock().unwrap() = State::Running;

        let identity = self.identity.clone();
        let fetcher = self.fetcher.clone();
        let registry = self.registry.clone();
        let middleware = self.middleware.clone();
        let retry_engine = self.retry_engine.clone();
        let events = self.events.clone();
        let stopping = self.stopping.clone();
        let state = self.state.clone();
        let idle_backoff = self.idle_backoff;
        let mut shutdown = self.shutdown.resubscribe();

        let handle = tokio::spawn(async move {
            loop {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                if shutdown.try_recv().is_ok() {
                    stopping.store(true, Ordering::SeqCst);
                    break;
                }

                match run_iteration(&fetcher, &registry, &middleware, &retry_engine, idle_backoff)
                    .await
                {
                    Ok(true) => {}   // work was performed; loop again immediately
                    Ok(false) => {}  // no work; brief idle already applied inside
                    Err(err) => {
                        *state.lock().unwrap() = State::Died;
                        let _ = events.send(ProcessorEvent::Died {
                            identity: identity.clone(),
                            error: err,
                        });
                        return;
                    }
                }
            }

            *state.lock().unwrap() = State::Stopped;
            let _ = events.send(ProcessorEvent::Stopped { identity });
        });

        self.handle = Some(handle);
    }

    /// Sets the stopping flag; optionally waits for the loop to notice and
    /// exit at its next loop-boundary check.
    pub async fn terminate(&mut self, wait: bool) {
        *self.state.lock().unwrap() = State::Stopping;
        self.stopping.store(true, Ordering::SeqCst);
        if wait {
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        }
    }

    /// Waits for the task to finish without setting the stopping flag
    /// itself — used by the manager's bounded join phase after
    /// `terminate` has already signaled every processor.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Hard-kill: aborts the underlying task immediately, interrupting it
    /// at its current suspension point. Optionally waits for the abort to
    /// be observed.
    pub async fn kill(&mut self, wait: bool) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = &self.handle {
            handle.abort();
        }
        if wait {
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        }
        *self.state.lock().unwrap() = State::Stopped;
    }
}

/// One pass of the loop body: fetch, parse, build handler, run middleware
/// chain, ack or route to the retry engine. Returns `Ok(true)` if a unit
/// was fetched and handled, `Ok(false)` if nothing was available, and
/// `Err(description)` for an unrecoverable loop error.
async fn run_iteration(
    fetcher: &Fetcher,
    registry: &Registry,
    middleware: &Chain,
    retry_engine: &Arc<RetryEngine>,
    idle_backoff: std::time::Duration,
) -> Result<bool, String> {
    let unit = match fetcher.fetch().await {
        Ok(Some(unit)) => unit,
        Ok(None) => {
            tokio::time::sleep(idle_backoff).await;
            return Ok(false);
        }
        Err(err) => {
            tracing::warn!(error = %err, "fetch failed, backing off");
            tokio::time::sleep(idle_backoff).await;
            return Ok(false);
        }
    };

    let job = match Job::load(&unit.payload) {
        Ok(job) => job,
        Err(err) => {
            tracing::error!(error = %err, payload = %unit.payload, "job payload failed to parse");
            if let Err(ack_err) = fetcher.ack(&unit).await {
                return Err(format!("ack after parse failure also failed: {ack_err}"));
            }
            return Ok(true);
        }
    };

    let handler = match registry.build(&job.class) {
        Ok(handler) => handler,
        Err(err) => {
            let job_err = JobError::failure("UnknownHandler", err.to_string());
            match retry_engine.handle_global(job, &job_err).await {
                Ok(Outcome::Shutdown) => return Ok(true), // leave in-flight
                Ok(_) => {
                    let _ = fetcher.ack(&unit).await;
                }
                Err(engine_err) => {
                    tracing::error!(error = %engine_err, "retry engine failed handling unknown handler");
                }
            }
            return Ok(true);
        }
    };

    let args = job.args.clone();
    let invocation = Invocation {
        worker: job.jid.clone(),
        payload: Value::Array(job.args.clone()),
        queue: job.queue.clone(),
    };

    let handler_for_terminal = handler.clone();
    let outcome_slot: Arc<Mutex<Option<Result<(), JobError>>>> = Arc::new(Mutex::new(None));
    let outcome_for_terminal = outcome_slot.clone();

    middleware
        .invoke(invocation, move |inv| {
            let handler = handler_for_terminal.clone();
            let outcome = outcome_for_terminal.clone();
            let args = match &inv.payload {
                Value::Array(items) => items.clone(),
                _ => args.clone(),
            };
            async move {
                let result = handler.perform(args).await;
                *outcome.lock().unwrap() = Some(result);
                inv
            }
        })
        .await;

    let result = outcome_slot.lock().unwrap().take().unwrap_or(Ok(()));

    match result {
        Ok(()) => {
            fetcher
                .ack(&unit)
                .await
                .map_err(|e| format!("ack after success failed: {e}"))?;
        }
        Err(err) => {
            if err.is_shutdown() {
                // Leave in-flight; requeue_on_shutdown handles it.
                return Ok(true);
            }
            match retry_engine.handle_local(job, &err, handler.as_ref()).await {
                Ok(Outcome::Shutdown) => {} // leave in-flight
                Ok(_) => {
                    fetcher
                        .ack(&unit)
                        .await
                        .map_err(|e| format!("ack after retry handling failed: {e}"))?;
                }
                Err(engine_err) => {
                    tracing::error!(error = %engine_err, "retry engine failed");
                    fetcher
                        .ack(&unit)
                        .await
                        .map_err(|e| format!("ack after engine error failed: {e}"))?;
                }
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datastore::MemoryDatastore;
    use crate::registry::{Handler, HandlerFactory};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysOk;
    #[async_trait]
    impl Handler for AlwaysOk {
        async fn perform(&self, _args: Vec<Value>) -> Result<(), JobError> {
            Ok(())
        }
    }
    struct AlwaysOkFactory;
    impl HandlerFactory for AlwaysOkFactory {
        fn build(&self) -> Arc<dyn Handler> {
            Arc::new(AlwaysOk)
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl Handler for AlwaysFail {
        async fn perform(&self, _args: Vec<Value>) -> Result<(), JobError> {
            Err(JobError::failure("RuntimeError", "boom"))
        }
    }
    struct AlwaysFailFactory;
    impl HandlerFactory for AlwaysFailFactory {
        fn build(&self) -> Arc<dyn Handler> {
            Arc::new(AlwaysFail)
        }
    }

    #[tokio::test]
    async fn happy_path_drains_queue_and_acks() {
        let store = Arc::new(MemoryDatastore::new());
        let job = Job::new("Ok", vec![Value::from(1)], "default");
        store.push("default", job.dump().unwrap()).await.unwrap();

        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            vec!["default".to_string()],
            crate::fetcher::OrderingPolicy::Strict,
            "w1",
            Duration::from_millis(50),
        ));
        let mut registry = Registry::new();
        registry.register("Ok", Arc::new(AlwaysOkFactory));
        let registry = Arc::new(registry);
        let retry_engine = Arc::new(RetryEngine::new(store.clone(), Config::default()));

        let result = run_iteration(
            &fetcher,
            &registry,
            &Chain::new(),
            &retry_engine,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert!(result);
        assert_eq!(store.queue_len("default").await.unwrap(), 0);
        assert!(store
            .inflight_snapshot("default:w1")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.set_len("retry").await.unwrap(), 0);
        assert_eq!(store.set_len("dead").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_handler_lands_in_retry_set() {
        let store = Arc::new(MemoryDatastore::new());
        let job = Job::new("Fail", vec![], "default");
        store.push("default", job.dump().unwrap()).await.unwrap();

        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            vec!["default".to_string()],
            crate::fetcher::OrderingPolicy::Strict,
            "w1",
            Duration::from_millis(50),
        ));
        let mut registry = Registry::new();
        registry.register("Fail", Arc::new(AlwaysFailFactory));
        let registry = Arc::new(registry);
        let retry_engine = Arc::new(RetryEngine::new(store.clone(), Config::default()));

        run_iteration(
            &fetcher,
            &registry,
            &Chain::new(),
            &retry_engine,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(store.set_len("retry").await.unwrap(), 1);
        assert!(store
            .inflight_snapshot("default:w1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unparseable_payload_is_acked_and_dropped() {
        let store = Arc::new(MemoryDatastore::new());
        store.push("default", "not json".to_string()).await.unwrap();

        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            vec!["default".to_string()],
            crate::fetcher::OrderingPolicy::Strict,
            "w1",
            Duration::from_millis(50),
        ));
        let registry = Arc::new(Registry::new());
        let retry_engine = Arc::new(RetryEngine::new(store.clone(), Config::default()));

        let result = run_iteration(
            &fetcher,
            &registry,
            &Chain::new(),
            &retry_engine,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert!(result);
        assert!(store
            .inflight_snapshot("default:w1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_routes_through_retry_engine() {
        let store = Arc::new(MemoryDatastore::new());
        let job = Job::new("Nonexistent", vec![], "default");
        store.push("default", job.dump().unwrap()).await.unwrap();

        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            vec!["default".to_string()],
            crate::fetcher::OrderingPolicy::Strict,
            "w1",
            Duration::from_millis(50),
        ));
        let registry = Arc::new(Registry::new());
        let retry_engine = Arc::new(RetryEngine::new(store.clone(), Config::default()));

        run_iteration(
            &fetcher,
            &registry,
            &Chain::new(),
            &retry_engine,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(store.set_len("retry").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn processor_start_and_terminate_reports_stopped() {
        let store = Arc::new(MemoryDatastore::new());
        let fetcher = Arc::new(Fetcher::new(
            store.clone(),
            vec!["default".to_string()],
            crate::fetcher::OrderingPolicy::Strict,
            "w1",
            Duration::from_millis(20),
        ));
        let registry = Arc::new(Registry::new());
        let retry_engine = Arc::new(RetryEngine::new(store.clone(), Config::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _keep_alive = shutdown_tx;

        let mut processor = Processor::new(
            "w1",
            fetcher,
            registry,
            Chain::new(),
            retry_engine,
            tx,
            Duration::from_millis(10),
            shutdown_rx,
        );
        processor.start();
        assert_eq!(processor.state(), State::Running);

        processor.terminate(true).await;
        assert_eq!(processor.state(), State::Stopped);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProcessorEvent::Stopped { .. }));
    }
}
