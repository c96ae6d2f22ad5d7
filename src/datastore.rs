//! Thin typed wrapper over the datastore's atomic primitives.
//!
//! The rest of the crate never talks to Redis directly: every primitive
//! operation is exposed here as one typed, async method on the
//! [`Datastore`] trait. `RedisDatastore` is the production implementation;
//! `MemoryDatastore` (left public so tests elsewhere in the crate can use
//! it) is an in-process fake used to exercise fetch/ack/retry/dead-letter
//! state transitions deterministically without a live Redis.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// Errors raised by datastore operations.
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Canonical Redis key for a named queue's pending list: `queue:<name>`.
pub fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

/// Canonical Redis key for a named queue's per-process in-flight list:
/// `queue:<name>:<identity>`.
pub fn inflight_key(queue: &str, identity: &str) -> String {
    format!("queue:{queue}:{identity}")
}

/// Statistics about a single named queue: pending, in-flight, dead-letter.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub dead: usize,
}

/// The atomic primitives this crate requires from a Redis-compatible
/// store.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// `LPUSH queue:<name> <payload>`.
    async fn push(&self, queue: &str, payload: String) -> Result<(), DatastoreError>;

    /// Batch form of [`Datastore::push`], applied atomically per item.
    async fn push_batch(&self, queue: &str, payloads: Vec<String>) -> Result<(), DatastoreError>;

    /// `BRPOPLPUSH queue:<name> queue:<name>:<identity> <timeout>`.
    async fn fetch(
        &self,
        queue: &str,
        inflight_list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DatastoreError>;

    /// `LREM queue:<name>:<identity> 1 <payload>`.
    async fn ack(&self, inflight_list: &str, payload: &str) -> Result<(), DatastoreError>;

    /// Returns every payload currently sitting in an in-flight list.
    async fn inflight_snapshot(&self, inflight_list: &str) -> Result<Vec<String>, DatastoreError>;

    /// Atomically drains every entry of an in-flight list onto the tail of
    /// `queue`, returning the number of entries moved.
    async fn drain_inflight(
        &self,
        inflight_list: &str,
        queue: &str,
    ) -> Result<usize, DatastoreError>;

    /// `ZADD <set_name> <score> <payload>`.
    async fn zadd(&self, set_name: &str, score: f64, payload: String) -> Result<(), DatastoreError>;

    /// Atomically promotes every entry in `set_name` scored `<= now`: for
    /// each, `ZREM` it from the set and `LPUSH` it onto the queue named by
    /// its own `queue` field. A failed per-entry promotion (lost race with
    /// another process) simply leaves that entry in place. Returns the
    /// number of entries promoted.
    async fn promote_due(&self, set_name: &str, now: f64) -> Result<usize, DatastoreError>;

    /// `ZADD dead <score> <payload>`, then evicts entries older than
    /// `max_age_secs` and truncates to `max_count` by score.
    async fn dead_letter(
        &self,
        payload: String,
        score: f64,
        max_age_secs: f64,
        max_count: usize,
    ) -> Result<(), DatastoreError>;

    /// `SADD processes <identity>`, `HSET <identity> info …`, `EXPIRE
    /// <identity> ttl_secs`.
    async fn heartbeat(
        &self,
        identity: &str,
        info: &str,
        ttl_secs: usize,
    ) -> Result<(), DatastoreError>;

    /// Removes `identity` from the process registry, the final step of a
    /// graceful shutdown.
    async fn deregister(&self, identity: &str) -> Result<(), DatastoreError>;

    /// Returns every identity currently present (and unexpired) in the
    /// process registry.
    async fn active_processes(&self) -> Result<HashSet<String>, DatastoreError>;

    /// Number of pending entries in a live queue.
    async fn queue_len(&self, queue: &str) -> Result<usize, DatastoreError>;

    /// Number of entries in a sorted set (`retry`, `schedule`, `dead`, …).
    async fn set_len(&self, set_name: &str) -> Result<usize, DatastoreError>;

    /// Introspection surface for a single queue: pending depth, in-flight
    /// count summed across every registered process's in-flight list for
    /// this queue, and the size of the shared dead-letter set.
    async fn stats(&self, queue: &str) -> Result<QueueStats, DatastoreError> {
        let pending = self.queue_len(queue).await?;
        let dead = self.set_len("dead").await?;
        let identities = self.active_processes().await?;
        let mut processing = 0;
        for identity in &identities {
            let inflight_list = inflight_key(queue, identity);
            processing += self.inflight_snapshot(&inflight_list).await?.len();
        }
        Ok(QueueStats {
            pending,
            processing,
            dead,
        })
    }
}

/// Production [`Datastore`] backed by a Redis (or Redis-compatible)
/// server, using `ConnectionManager` for automatic reconnection.
pub struct RedisDatastore {
    conn: ConnectionManager,
}

impl RedisDatastore {
    pub async fn connect(redis_url: &str) -> Result<Self, DatastoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| DatastoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DatastoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Extracts the `queue` field from a raw job payload without fully
    /// deserializing it into a [`crate::envelope::Job`].
    fn target_queue(payload: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        value.get("queue")?.as_str().map(str::to_owned)
    }
}

#[async_trait]
impl Datastore for RedisDatastore {
    async fn push(&self, queue: &str, payload: String) -> Result<(), DatastoreError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue_key(queue), payload).await?;
        Ok(())
    }

    async fn push_batch(&self, queue: &str, payloads: Vec<String>) -> Result<(), DatastoreError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let key = queue_key(queue);
        let mut pipe = redis::pipe();
        for payload in &payloads {
            pipe.lpush(&key, payload);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        inflight_list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DatastoreError> {
        let mut conn = self.conn.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(queue_key(queue))
            .arg(inflight_list)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result)
    }

    async fn ack(&self, inflight_list: &str, payload: &str) -> Result<(), DatastoreError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(inflight_list, 1, payload).await?;
        Ok(())
    }

    async fn inflight_snapshot(&self, inflight_list: &str) -> Result<Vec<String>, DatastoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(inflight_list, 0, -1).await?)
    }

    async fn drain_inflight(
        &self,
        inflight_list: &str,
        queue: &str,
    ) -> Result<usize, DatastoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            local n = 0
            while true do
                local item = redis.call('RPOP', KEYS[1])
                if not item then break end
                redis.call('LPUSH', KEYS[2], item)
                n = n + 1
            end
            return n
            "#,
        );
        let moved: usize = script
            .key(inflight_list)
            .key(queue_key(queue))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn zadd(&self, set_name: &str, score: f64, payload: String) -> Result<(), DatastoreError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(set_name, payload, score).await?;
        Ok(())
    }

    async fn promote_due(&self, set_name: &str, now: f64) -> Result<usize, DatastoreError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(set_name, f64::NEG_INFINITY, now)
            .await?;

        let script = redis::Script::new(
            r#"
            if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
                redis.call('ZREM', KEYS[1], ARGV[1])
                redis.call('LPUSH', KEYS[2], ARGV[1])
                return 1
            end
            return 0
            "#,
        );

        let mut promoted = 0usize;
        for payload in due {
            let Some(queue) = Self::target_queue(&payload) else {
                continue;
            };
            let moved: i64 = script
                .key(set_name)
                .key(queue_key(&queue))
                .arg(&payload)
                .invoke_async(&mut conn)
                .await?;
            promoted += moved as usize;
        }
        Ok(promoted)
    }

    async fn dead_letter(
        &self,
        payload: String,
        score: f64,
        max_age_secs: f64,
        max_count: usize,
    ) -> Result<(), DatastoreError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>("dead", payload, score).await?;

        let cutoff = score - max_age_secs;
        conn.zrembyscore::<_, _, _, ()>("dead", f64::NEG_INFINITY, cutoff)
            .await?;

        let total: isize = conn.zcard("dead").await?;
        let overflow = total - max_count as isize;
        if overflow > 0 {
            conn.zremrangebyrank::<_, ()>("dead", 0, overflow - 1).await?;
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        identity: &str,
        info: &str,
        ttl_secs: usize,
    ) -> Result<(), DatastoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd("processes", identity)
            .hset(identity, "info", info)
            .expire(identity, ttl_secs as i64);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn deregister(&self, identity: &str) -> Result<(), DatastoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().srem("processes", identity).del(identity);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn active_processes(&self) -> Result<HashSet<String>, DatastoreError> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn.smembers("processes").await?;
        Ok(members)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, DatastoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue_key(queue)).await?)
    }

    async fn set_len(&self, set_name: &str) -> Result<usize, DatastoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(set_name).await?)
    }
}

/// In-process fake [`Datastore`] used by unit/integration tests that need
/// to exercise fetch/ack/retry/dead-letter transitions without a live
/// Redis.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, Vec<(String, f64)>>,
    processes: HashSet<String>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn push(&self, queue: &str, payload: String) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        state.lists.entry(queue_key(queue)).or_default().insert(0, payload);
        Ok(())
    }

    async fn push_batch(&self, queue: &str, payloads: Vec<String>) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        let list = state.lists.entry(queue_key(queue)).or_default();
        for payload in payloads {
            list.insert(0, payload);
        }
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        inflight_list: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        let item = state.lists.get_mut(&queue_key(queue)).and_then(|l| l.pop());
        if let Some(ref payload) = item {
            state
                .lists
                .entry(inflight_list.to_string())
                .or_default()
                .insert(0, payload.clone());
        }
        Ok(item)
    }

    async fn ack(&self, inflight_list: &str, payload: &str) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(list) = state.lists.get_mut(inflight_list) {
            if let Some(pos) = list.iter().position(|p| p == payload) {
                list.remove(pos);
            }
        }
        Ok(())
    }

    async fn inflight_snapshot(&self, inflight_list: &str) -> Result<Vec<String>, DatastoreError> {
        let state = self.inner.lock().unwrap();
        Ok(state.lists.get(inflight_list).cloned().unwrap_or_default())
    }

    async fn drain_inflight(
        &self,
        inflight_list: &str,
        queue: &str,
    ) -> Result<usize, DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        let drained = state.lists.remove(inflight_list).unwrap_or_default();
        let count = drained.len();
        let dest = state.lists.entry(queue_key(queue)).or_default();
        for item in drained.into_iter().rev() {
            dest.push(item);
        }
        Ok(count)
    }

    async fn zadd(&self, set_name: &str, score: f64, payload: String) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        let set = state.sets.entry(set_name.to_string()).or_default();
        set.retain(|(p, _)| p != &payload);
        set.push((payload, score));
        Ok(())
    }

    async fn promote_due(&self, set_name: &str, now: f64) -> Result<usize, DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        let Some(set) = state.sets.get_mut(set_name) else {
            return Ok(0);
        };
        let (due, remaining): (Vec<_>, Vec<_>) = set.drain(..).partition(|(_, score)| *score <= now);
        *set = remaining;

        let mut promoted = Vec::new();
        for (payload, _) in due {
            let queue = serde_json::from_str::<serde_json::Value>(&payload)
                .ok()
                .and_then(|v| v.get("queue").and_then(|q| q.as_str().map(str::to_owned)));
            if let Some(queue) = queue {
                promoted.push((queue, payload));
            }
        }
        let count = promoted.len();
        for (queue, payload) in promoted {
            state.lists.entry(queue_key(&queue)).or_default().insert(0, payload);
        }
        Ok(count)
    }

    async fn dead_letter(
        &self,
        payload: String,
        score: f64,
        max_age_secs: f64,
        max_count: usize,
    ) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        let set = state.sets.entry("dead".to_string()).or_default();
        set.push((payload, score));
        let cutoff = score - max_age_secs;
        set.retain(|(_, s)| *s > cutoff);
        set.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        if set.len() > max_count {
            let overflow = set.len() - max_count;
            set.drain(0..overflow);
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        identity: &str,
        _info: &str,
        _ttl_secs: usize,
    ) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        state.processes.insert(identity.to_string());
        Ok(())
    }

    async fn deregister(&self, identity: &str) -> Result<(), DatastoreError> {
        let mut state = self.inner.lock().unwrap();
        state.processes.remove(identity);
        Ok(())
    }

    async fn active_processes(&self) -> Result<HashSet<String>, DatastoreError> {
        let state = self.inner.lock().unwrap();
        Ok(state.processes.clone())
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, DatastoreError> {
        let state = self.inner.lock().unwrap();
        Ok(state.lists.get(&queue_key(queue)).map(Vec::len).unwrap_or(0))
    }

    async fn set_len(&self, set_name: &str) -> Result<usize, DatastoreError> {
        let state = self.inner.lock().unwrap();
        Ok(state.sets.get(set_name).map(Vec::len).unwrap_or(0))
    }
}
