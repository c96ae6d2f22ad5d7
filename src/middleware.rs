//! Ordered, composable interceptor pipeline invoked around job execution.
//!
//! Each entry wraps a factory that produces a fresh [`Middleware`] instance
//! per invocation. `Chain::invoke` folds the entries inside-out into a
//! continuation that calls the next entry, with `terminal` run at the
//! deepest point. A middleware that never calls `next` short-circuits
//! everything inward of it, terminal included — that is a first-class
//! semantic, not an error condition.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// The arguments an interceptor forwards to the next link in the chain
/// (or that the terminal ultimately receives). Carried by value so each
/// middleware is free to rewrite them before forwarding.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub worker: String,
    pub payload: Value,
    pub queue: String,
}

/// The remaining portion of the chain, callable at most once per
/// middleware invocation. Calling it runs the next interceptor (or the
/// terminal, if this is the last one).
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: &'a (dyn Fn(Invocation) -> BoxFuture<'a, Invocation> + Send + Sync + 'a),
}

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

impl<'a> Next<'a> {
    /// Invokes the next middleware (or the terminal if the chain is
    /// exhausted), forwarding whatever `invocation` this call was given.
    pub async fn call(self, invocation: Invocation) -> Invocation {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    remaining: rest,
                    terminal: self.terminal,
                };
                head.call(invocation, next).await
            }
            None => (self.terminal)(invocation).await,
        }
    }
}

/// A single interceptor. Implementations decide whether to call `next`
/// (continuing the chain) and may inspect/rewrite the invocation on the
/// way in and on the way out.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, invocation: Invocation, next: Next<'_>) -> Invocation;
}

/// Produces a fresh [`Middleware`] instance per invocation, wrapping a
/// factory rather than a shared instance.
pub trait MiddlewareFactory: Send + Sync {
    fn build(&self) -> Arc<dyn Middleware>;

    /// Identity used for add/remove/insert-relative-to and
    /// duplicate-replacement semantics. Defaults to the factory's type
    /// name, which is sufficient unless a caller registers the same type
    /// twice under different configurations.
    fn key(&self) -> &str;
}

/// One entry in the chain: a named factory, kept distinct from the
/// instances it produces.
struct Entry {
    key: String,
    factory: Arc<dyn MiddlewareFactory>,
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Entry {
            key: self.key.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").field("key", &self.key).finish()
    }
}

/// An ordered, cloneable collection of middleware entries. Server and
/// client chains are independent clones of whatever base chain they
/// started from.
#[derive(Clone, Default)]
pub struct Chain {
    entries: Vec<Entry>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `factory`, replacing any existing entry with the same key.
    pub fn add(&mut self, factory: Arc<dyn MiddlewareFactory>) {
        let key = factory.key().to_string();
        self.entries.retain(|e| e.key != key);
        self.entries.push(Entry { key, factory });
    }

    /// Inserts `factory` at the head, replacing any existing entry with
    /// the same key.
    pub fn prepend(&mut self, factory: Arc<dyn MiddlewareFactory>) {
        let key = factory.key().to_string();
        self.entries.retain(|e| e.key != key);
        self.entries.insert(0, Entry { key, factory });
    }

    /// Inserts `factory` immediately before the entry keyed `anchor`.
    /// No-op if `anchor` is absent.
    pub fn insert_before(&mut self, anchor: &str, factory: Arc<dyn MiddlewareFactory>) {
        let Some(pos) = self.entries.iter().position(|e| e.key == anchor) else {
            return;
        };
        let key = factory.key().to_string();
        self.entries.retain(|e| e.key != key);
        let pos = self.entries.iter().position(|e| e.key == anchor).unwrap_or(pos);
        self.entries.insert(pos, Entry { key, factory });
    }

    /// Inserts `factory` immediately after the entry keyed `anchor`.
    /// No-op if `anchor` is absent.
    pub fn insert_after(&mut self, anchor: &str, factory: Arc<dyn MiddlewareFactory>) {
        let Some(pos) = self.entries.iter().position(|e| e.key == anchor) else {
            return;
        };
        let key = factory.key().to_string();
        self.entries.retain(|e| e.key != key);
        let pos = self
            .entries
            .iter()
            .position(|e| e.key == anchor)
            .map(|p| p + 1)
            .unwrap_or(pos + 1);
        self.entries.insert(pos, Entry { key, factory });
    }

    /// Removes the entry keyed `key`. No-op if absent.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|e| e.key != key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Read-only snapshot of entry keys, in chain order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Builds a fresh interceptor instance per entry, then invokes the
    /// chain with `terminal` at the deepest point.
    pub async fn invoke<T, F>(&self, invocation: Invocation, terminal: T) -> Invocation
    where
        T: Fn(Invocation) -> F + Send + Sync,
        F: std::future::Future<Output = Invocation> + Send,
    {
        let instances: Vec<Arc<dyn Middleware>> =
            self.entries.iter().map(|e| e.factory.build()).collect();
        let boxed_terminal = move |inv: Invocation| -> BoxFuture<'_, Invocation> {
            Box::pin(terminal(inv))
        };
        let next = Next {
            remaining: &instances,
            terminal: &boxed_terminal,
        };
        next.call(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Recorder {
        async fn call(&self, invocation: Invocation, next: Next<'_>) -> Invocation {
            self.0.lock().unwrap().push(format!("{}-before", invocation.worker));
            let result = next.call(invocation).await;
            self.0.lock().unwrap().push(format!("{}-after", result.worker));
            result
        }
    }

    struct RecorderFactory {
        key: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl MiddlewareFactory for RecorderFactory {
        fn build(&self) -> Arc<dyn Middleware> {
            Arc::new(Recorder(self.log.clone()))
        }

        fn key(&self) -> &str {
            &self.key
        }
    }

    struct SilentFactory {
        key: String,
    }

    struct Silent;

    #[async_trait]
    impl Middleware for Silent {
        async fn call(&self, invocation: Invocation, _next: Next<'_>) -> Invocation {
            // Deliberately never calls `next`.
            invocation
        }
    }

    impl MiddlewareFactory for SilentFactory {
        fn build(&self) -> Arc<dyn Middleware> {
            Arc::new(Silent)
        }

        fn key(&self) -> &str {
            &self.key
        }
    }

    fn invocation(worker: &str) -> Invocation {
        Invocation {
            worker: worker.to_string(),
            payload: Value::Null,
            queue: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn runs_before_in_order_and_after_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        for name in ["A", "B", "C"] {
            chain.add(Arc::new(RecorderFactory {
                key: name.to_string(),
                log: log.clone(),
            }));
        }

        let log_for_terminal = log.clone();
        chain
            .invoke(invocation("job"), move |inv| {
                log_for_terminal.lock().unwrap().push("work".to_string());
                async move { inv }
            })
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "job-before", "job-before", "job-before", "work", "job-after", "job-after",
                "job-after",
            ]
        );
    }

    #[tokio::test]
    async fn non_yielding_middleware_skips_everything_inward() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(RecorderFactory {
            key: "A".to_string(),
            log: log.clone(),
        }));
        chain.add(Arc::new(SilentFactory { key: "silent".to_string() }));
        chain.add(Arc::new(RecorderFactory {
            key: "C".to_string(),
            log: log.clone(),
        }));

        let log_for_terminal = log.clone();
        chain
            .invoke(invocation("job"), move |inv| {
                log_for_terminal.lock().unwrap().push("work".to_string());
                async move { inv }
            })
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["job-before", "job-after"]);
    }

    #[test]
    fn add_replaces_existing_entry_for_same_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(RecorderFactory { key: "A".into(), log: log.clone() }));
        chain.add(Arc::new(RecorderFactory { key: "B".into(), log: log.clone() }));
        chain.add(Arc::new(RecorderFactory { key: "A".into(), log: log.clone() }));
        assert_eq!(chain.entries(), vec!["B", "A"]);
        assert_eq!(chain.count(), 2);
    }

    #[test]
    fn prepend_inserts_at_head() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(RecorderFactory { key: "A".into(), log: log.clone() }));
        chain.prepend(Arc::new(RecorderFactory { key: "Z".into(), log }));
        assert_eq!(chain.entries(), vec!["Z", "A"]);
    }

    #[test]
    fn insert_before_and_after_anchor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(RecorderFactory { key: "A".into(), log: log.clone() }));
        chain.add(Arc::new(RecorderFactory { key: "C".into(), log: log.clone() }));
        chain.insert_before("C", Arc::new(RecorderFactory { key: "B".into(), log: log.clone() }));
        assert_eq!(chain.entries(), vec!["A", "B", "C"]);
        chain.insert_after("A", Arc::new(RecorderFactory { key: "A.5".into(), log }));
        assert_eq!(chain.entries(), vec!["A", "A.5", "B", "C"]);
    }

    #[test]
    fn remove_is_noop_if_absent() {
        let mut chain = Chain::new();
        chain.remove("nope");
        assert_eq!(chain.count(), 0);
    }

    #[test]
    fn exists_and_clear() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.add(Arc::new(RecorderFactory { key: "A".into(), log }));
        assert!(chain.exists("A"));
        chain.clear();
        assert!(!chain.exists("A"));
        assert_eq!(chain.count(), 0);
    }
}
