//! Blocks on a configured set of queues and returns work units. Moves
//! items atomically into a per-process in-flight list so a crash can be
//! recovered from by another process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::broadcast;

use crate::datastore::{Datastore, DatastoreError};

/// A unit of work together with the queue it was fetched from — needed so
/// acknowledgement and retry redirection know where it came from.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub queue: String,
    pub payload: String,
}

/// Queue probing order used on each fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
    /// Probe queues in declared order; earlier queues drain entirely
    /// before later ones are considered.
    Strict,
    /// Shuffle the queue list per fetch for fairness over time.
    WeightedRandom,
}

/// Blocking pull from a configured set of queues, with shutdown signaling
/// and crash-recovery helpers. One instance is shared (via `Arc`) across
/// all processors of a single manager.
pub struct Fetcher {
    datastore: Arc<dyn Datastore>,
    queues: Vec<String>,
    policy: OrderingPolicy,
    identity: String,
    fetch_timeout: Duration,
    shutting_down: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl Fetcher {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queues: Vec<String>,
        policy: OrderingPolicy,
        identity: impl Into<String>,
        fetch_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            datastore,
            queues,
            policy,
            identity: identity.into(),
            fetch_timeout,
            shutting_down: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signals the fetcher to stop issuing new work. All subsequent
    /// blocking calls return `None` immediately.
    pub fn signal_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    fn in_flight_key(&self, queue: &str) -> String {
        crate::datastore::inflight_key(queue, &self.identity)
    }

    fn ordered_queues(&self) -> Vec<String> {
        let mut queues = self.queues.clone();
        if self.policy == OrderingPolicy::WeightedRandom {
            queues.shuffle(&mut rand::rng());
        }
        queues
    }

    /// Blocks up to `fetch_timeout` waiting for any configured queue to
    /// have an item. Returns `None` if shutdown has been signaled, if the
    /// queue list is empty, or if nothing appeared before the timeout.
    /// Datastore errors are swallowed here; callers apply their own
    /// back-off.
    pub async fn fetch(&self) -> Result<Option<WorkUnit>, DatastoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if self.queues.is_empty() {
            tokio::time::sleep(self.fetch_timeout).await;
            return Ok(None);
        }

        let queues = self.ordered_queues();
        let per_queue_timeout = match self.policy {
            OrderingPolicy::Strict => {
                // Strict drains earlier queues entirely before considering
                // later ones: split the budget so the full timeout is
                // still respected across one probing pass.
                self.fetch_timeout / queues.len() as u32
            }
            OrderingPolicy::WeightedRandom => self.fetch_timeout,
        };

        for queue in &queues {
            let inflight = self.in_flight_key(queue);
            let timeout = per_queue_timeout.max(Duration::from_millis(1));
            if let Some(payload) = self.datastore.fetch(queue, &inflight, timeout).await? {
                return Ok(Some(WorkUnit {
                    queue: queue.clone(),
                    payload,
                }));
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Removes exactly one matching payload from its in-flight list.
    pub async fn ack(&self, unit: &WorkUnit) -> Result<(), DatastoreError> {
        let inflight = self.in_flight_key(&unit.queue);
        self.datastore.ack(&inflight, &unit.payload).await
    }

    /// Moves all of this process's in-flight items back to the tail of
    /// their source queues. Called during graceful shutdown.
    pub async fn requeue_on_shutdown(&self) -> Result<usize, DatastoreError> {
        let mut total = 0;
        for queue in &self.queues {
            let inflight = self.in_flight_key(queue);
            total += self.datastore.drain_inflight(&inflight, queue).await?;
        }
        Ok(total)
    }

    /// Crash recovery for *another* process: drains in-flight lists whose
    /// owning identity is no longer present in the active-process
    /// registry. `known_identities` lists candidate identities to check
    /// (typically discovered out-of-band, e.g. via a `SCAN` over
    /// `queue:*:*` key patterns) since this core's `Datastore` trait does
    /// not expose key scanning.
    pub async fn reap_orphans(
        &self,
        known_identities: &[String],
    ) -> Result<usize, DatastoreError> {
        let active = self.datastore.active_processes().await?;
        let mut total = 0;
        for identity in known_identities {
            if active.contains(identity) {
                continue;
            }
            for queue in &self.queues {
                let inflight = crate::datastore::inflight_key(queue, identity);
                total += self.datastore.drain_inflight(&inflight, queue).await?;
            }
        }
        Ok(total)
    }
}
