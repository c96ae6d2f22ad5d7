//! Enqueue-side client surface: `push`/`push_bulk` against a live queue.

use std::sync::Arc;

use serde_json::Value;

use crate::datastore::{Datastore, DatastoreError};
use crate::envelope::Job;

/// Pushes job envelopes onto live queues. Duplicate `jid`s are
/// caller-allowed; this client never deduplicates.
pub struct Client {
    datastore: Arc<dyn Datastore>,
}

impl Client {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Enqueues one job, returning its `jid`.
    pub async fn push(
        &self,
        class: impl Into<String>,
        args: Vec<Value>,
        queue: impl Into<String>,
    ) -> Result<String, DatastoreError> {
        let job = Job::new(class, args, queue);
        let jid = job.jid.clone();
        let payload = job.dump().map_err(|_| DatastoreError::Connection("envelope serialization failed".to_string()))?;
        self.datastore.push(&job.queue, payload).await?;
        Ok(jid)
    }

    /// Enqueues many jobs of the same class/queue, returning their `jid`s
    /// in order.
    pub async fn push_bulk(
        &self,
        class: impl Into<String>,
        args_list: Vec<Vec<Value>>,
        queue: impl Into<String>,
    ) -> Result<Vec<String>, DatastoreError> {
        let class = class.into();
        let queue = queue.into();
        let mut jids = Vec::with_capacity(args_list.len());
        let mut payloads = Vec::with_capacity(args_list.len());
        for args in args_list {
            let job = Job::new(class.clone(), args, queue.clone());
            jids.push(job.jid.clone());
            let payload = job.dump().map_err(|_| DatastoreError::Connection("envelope serialization failed".to_string()))?;
            payloads.push(payload);
        }
        self.datastore.push_batch(&queue, payloads).await?;
        Ok(jids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;

    #[tokio::test]
    async fn push_enqueues_and_returns_jid() {
        let store = Arc::new(MemoryDatastore::new());
        let client = Client::new(store.clone());

        let jid = client.push("Worker", vec![Value::from(1)], "default").await.unwrap();
        assert_eq!(jid.len(), 24);
        assert_eq!(store.queue_len("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn push_bulk_enqueues_all_and_allows_duplicate_jids_upstream() {
        let store = Arc::new(MemoryDatastore::new());
        let client = Client::new(store.clone());

        let jids = client
            .push_bulk("Worker", vec![vec![Value::from(1)], vec![Value::from(2)]], "default")
            .await
            .unwrap();
        assert_eq!(jids.len(), 2);
        assert_eq!(store.queue_len("default").await.unwrap(), 2);
    }
}
