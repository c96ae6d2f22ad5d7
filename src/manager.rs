//! Owns the processor pool: startup, crash-replace, and the coordinated
//! graceful shutdown protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::datastore::Datastore;
use crate::fetcher::{Fetcher, OrderingPolicy};
use crate::middleware::Chain;
use crate::poller::Poller;
use crate::processor::{Processor, ProcessorEvent, State};
use crate::registry::Registry;
use crate::retry::RetryEngine;

/// Owns N processors sharing one fetcher, one middleware chain snapshot,
/// and one handler registry.
pub struct Manager {
    config: Config,
    identity: String,
    datastore: Arc<dyn Datastore>,
    fetcher: Arc<Fetcher>,
    registry: Arc<Registry>,
    middleware: Chain,
    retry_engine: Arc<RetryEngine>,
    poller: Arc<Poller>,
    processors: Vec<Processor>,
    events_tx: mpsc::UnboundedSender<ProcessorEvent>,
    events_rx: mpsc::UnboundedReceiver<ProcessorEvent>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl Manager {
    pub fn new(
        config: Config,
        identity: impl Into<String>,
        datastore: Arc<dyn Datastore>,
        registry: Arc<Registry>,
        middleware: Chain,
    ) -> Self {
        let identity = identity.into();
        let policy = if config.strict {
            OrderingPolicy::Strict
        } else {
            OrderingPolicy::WeightedRandom
        };
        let fetcher = Arc::new(Fetcher::new(
            datastore.clone(),
            config.queues.clone(),
            policy,
            identity.clone(),
            config.fetch_timeout,
        ));
        let retry_engine = Arc::new(RetryEngine::new(datastore.clone(), config.clone()));
        let poller = Arc::new(Poller::new(
            datastore.clone(),
            config.average_scheduled_poll_interval,
            identity.clone(),
            config.heartbeat_ttl,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            identity,
            datastore,
            fetcher,
            registry,
            middleware,
            retry_engine,
            poller,
            processors: Vec::new(),
            events_tx,
            events_rx,
            shutdown_tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_processor(&mut self, index: usize) {
        let identity = format!("{}-{index}", self.identity);
        let mut processor = Processor::new(
            identity,
            self.fetcher.clone(),
            self.registry.clone(),
            self.middleware.clone(),
            self.retry_engine.clone(),
            self.events_tx.clone(),
            self.config.fetch_error_backoff,
            self.shutdown_tx.subscribe(),
        );
        processor.start();
        self.processors.push(processor);
    }

    /// Registers this process's identity and spawns `config.concurrency`
    /// processors plus the scheduled poller.
    pub async fn start(&mut self) -> Result<(), crate::datastore::DatastoreError> {
        self.datastore
            .heartbeat(&self.identity, "{}", self.config.heartbeat_ttl.as_secs() as usize)
            .await?;

        for i in 0..self.config.concurrency {
            self.spawn_processor(i);
        }

        let poller = self.poller.clone();
        let poller_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            poller.run(poller_shutdown).await;
        });

        Ok(())
    }

    /// Drains one pending lifecycle event, if any, applying the
    /// `processor_stopped`/`processor_died` callback behavior: replace the
    /// processor unless the manager is shutting down.
    pub fn poll_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ProcessorEvent::Stopped { identity } => {
                    tracing::info!(identity = %identity, "processor stopped");
                }
                ProcessorEvent::Died { identity, error } => {
                    tracing::error!(identity = %identity, error = %error, "processor died");
                }
            }
            if !self.shutting_down.load(Ordering::SeqCst) {
                self.processors.retain(|p| p.state() != State::Died && p.state() != State::Stopped);
                let replacement_index = self.processors.len();
                self.spawn_processor(replacement_index);
            }
        }
    }

    /// Drives [`Manager::poll_events`] on a timer for as long as this
    /// future is polled. Meant to be raced against a shutdown signal via
    /// `tokio::select!`: it never returns on its own, so the other branch
    /// winning is what stops it.
    pub async fn run_event_loop(&mut self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
        loop {
            ticker.tick().await;
            self.poll_events();
        }
    }

    /// Graceful shutdown protocol: signal, terminate, bounded join, hard
    /// kill stragglers, requeue in-flight work, deregister.
    pub async fn shutdown(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        // 1. Signal fetcher to stop issuing new work.
        self.fetcher.signal_shutdown();
        // (also tells the poller to stop ticking)
        let _ = self.shutdown_tx.send(());

        // 2. Signal each processor to stop at loop boundary.
        for processor in &mut self.processors {
            processor.terminate(false).await;
        }

        // 3. Wait up to hard_timeout for processors to join.
        let hard_timeout = self.config.shutdown_timeout;
        let processors = &mut self.processors;
        let join_all = async {
            for processor in processors.iter_mut() {
                processor.join().await;
            }
        };
        if tokio::time::timeout(hard_timeout, join_all).await.is_err() {
            // 4. Hard-kill stragglers.
            for processor in &mut self.processors {
                if processor.state() != State::Stopped {
                    processor.kill(true).await; // also covers step 5 (join) for these
                }
            }
        }

        // 6. Drain in-flight lists back to source queues.
        if let Err(err) = self.fetcher.requeue_on_shutdown().await {
            tracing::warn!(error = %err, "failed to requeue in-flight work during shutdown");
        }

        // 7. Deregister process identity from the registry.
        if let Err(err) = self.datastore.deregister(&self.identity).await {
            tracing::warn!(error = %err, "failed to deregister process identity");
        }
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }
}
