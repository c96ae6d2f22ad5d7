//! Scheduled poller: promotes due entries from `retry`/`scheduled` sorted
//! sets onto their live queues.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;

use crate::datastore::Datastore;

/// The time-ordered sets the poller sweeps each tick.
const POLLED_SETS: [&str; 2] = ["retry", "schedule"];

/// Single long-lived task promoting due jobs. The interval adapts to
/// fleet size via the process registry's self-reported liveness:
/// `average_interval ≈ base_interval / process_count`, falling back to a
/// fixed default if the registry is unavailable or empty.
pub struct Poller {
    datastore: Arc<dyn Datastore>,
    base_interval: Duration,
    identity: String,
    heartbeat_ttl: Duration,
}

impl Poller {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        base_interval: Duration,
        identity: impl Into<String>,
        heartbeat_ttl: Duration,
    ) -> Self {
        Self {
            datastore,
            base_interval,
            identity: identity.into(),
            heartbeat_ttl,
        }
    }

    /// Re-issues this process's heartbeat, refreshing its registry expiry.
    /// Called once per tick so the registry never drops a live process.
    pub async fn refresh_heartbeat(&self) -> Result<(), crate::datastore::DatastoreError> {
        self.datastore
            .heartbeat(&self.identity, "{}", self.heartbeat_ttl.as_secs() as usize)
            .await
    }

    /// Promotes every due entry across the polled sets in a single tick.
    /// Returns the total number of entries promoted.
    pub async fn tick(&self) -> Result<usize, crate::datastore::DatastoreError> {
        let now = now_epoch();
        let mut promoted = 0;
        for set_name in POLLED_SETS {
            promoted += self.datastore.promote_due(set_name, now).await?;
        }
        Ok(promoted)
    }

    /// Computes the next poll interval: `average_interval ± jitter`, where
    /// `average_interval` shrinks as the reporting fleet grows.
    pub async fn next_interval(&self) -> Duration {
        let process_count = self
            .datastore
            .active_processes()
            .await
            .map(|set| set.len().max(1))
            .unwrap_or(1);

        let average = if process_count > 0 {
            self.base_interval.div_f64(process_count as f64)
        } else {
            self.base_interval
        };

        let jitter_fraction: f64 = rand::rng().random_range(-0.25..0.25);
        let jittered = average.as_secs_f64() * (1.0 + jitter_fraction);
        Duration::from_secs_f64(jittered.max(0.1))
    }

    /// Runs the poll loop until `shutdown` fires, sleeping
    /// `next_interval()` between ticks.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.next_interval().await) => {
                    if let Err(err) = self.refresh_heartbeat().await {
                        tracing::warn!(error = %err, "heartbeat refresh failed");
                    }
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "scheduled poll tick failed");
                    }
                }
            }
        }
    }
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;

    #[tokio::test]
    async fn tick_promotes_due_entries_from_both_sets() {
        let store = Arc::new(MemoryDatastore::new());
        store
            .zadd("retry", 0.0, r#"{"queue":"default","jid":"a"}"#.to_string())
            .await
            .unwrap();
        store
            .zadd("schedule", 0.0, r#"{"queue":"default","jid":"b"}"#.to_string())
            .await
            .unwrap();

        let poller = Poller::new(store.clone(), Duration::from_secs(15), "test-proc", Duration::from_secs(60));
        let promoted = poller.tick().await.unwrap();

        assert_eq!(promoted, 2);
        assert_eq!(store.queue_len("default").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn not_yet_due_entries_stay_in_place() {
        let store = Arc::new(MemoryDatastore::new());
        let far_future = now_epoch() + 10_000.0;
        store
            .zadd("retry", far_future, r#"{"queue":"default","jid":"a"}"#.to_string())
            .await
            .unwrap();

        let poller = Poller::new(store.clone(), Duration::from_secs(15), "test-proc", Duration::from_secs(60));
        let promoted = poller.tick().await.unwrap();

        assert_eq!(promoted, 0);
        assert_eq!(store.set_len("retry").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn interval_shrinks_with_larger_fleet() {
        let store = Arc::new(MemoryDatastore::new());
        for i in 0..10 {
            store.heartbeat(&format!("proc-{i}"), "{}", 60).await.unwrap();
        }
        let poller = Poller::new(store, Duration::from_secs(15), "test-proc", Duration::from_secs(60));
        let interval = poller.next_interval().await;
        // 15s / 10 processes = 1.5s average, ±25% jitter.
        assert!(interval < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn refresh_heartbeat_keeps_identity_registered() {
        let store = Arc::new(MemoryDatastore::new());
        let poller = Poller::new(store.clone(), Duration::from_secs(15), "test-proc", Duration::from_secs(60));
        poller.refresh_heartbeat().await.unwrap();
        assert!(store.active_processes().await.unwrap().contains("test-proc"));
    }

    #[tokio::test]
    async fn interval_falls_back_to_base_when_registry_empty() {
        let store = Arc::new(MemoryDatastore::new());
        let poller = Poller::new(store, Duration::from_secs(15), "test-proc", Duration::from_secs(60));
        let interval = poller.next_interval().await;
        assert!(interval >= Duration::from_secs(10));
        assert!(interval <= Duration::from_secs(20));
    }
}
