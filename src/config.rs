//! Explicit configuration object, passed by reference to every component
//! at construction rather than read from a global singleton.

use std::time::Duration;

/// Ordered queue list plus fetch ordering policy, concurrency and retry
/// tuning, and connection settings for one running instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of processors per instance.
    pub concurrency: usize,
    /// Ordered list of queue names; duplicates weight the
    /// weighted-random policy.
    pub queues: Vec<String>,
    /// If true, strict-order fetch; else weighted-random.
    pub strict: bool,
    /// Default attempt cap consulted when a job's `retry` field and the
    /// handler's declared default are both absent.
    pub max_retries: u32,
    /// Shutdown hard-timeout.
    pub shutdown_timeout: Duration,
    /// Fetch block timeout.
    pub fetch_timeout: Duration,
    /// Back-off applied after a datastore error during fetch.
    pub fetch_error_backoff: Duration,
    /// Base scheduled-poll interval (before fleet-size adaptation and
    /// jitter).
    pub average_scheduled_poll_interval: Duration,
    /// Dead set age cap.
    pub dead_max_age: Duration,
    /// Dead set count cap.
    pub dead_max_count: usize,
    /// Process registry heartbeat TTL.
    pub heartbeat_ttl: Duration,
    /// Redis connection string.
    pub redis_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec!["default".to_string()],
            strict: true,
            max_retries: 25,
            shutdown_timeout: Duration::from_secs(25),
            fetch_timeout: Duration::from_secs(2),
            fetch_error_backoff: Duration::from_secs(1),
            average_scheduled_poll_interval: Duration::from_secs(15),
            dead_max_age: Duration::from_secs(180 * 24 * 60 * 60),
            dead_max_count: 10_000,
            heartbeat_ttl: Duration::from_secs(60),
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Config {
    /// Overrides defaults from `JOBFORGE_*` environment variables. Any
    /// variable that is absent or fails to parse keeps the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("JOBFORGE_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                config.concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_QUEUES") {
            config.queues = v.split(',').map(str::trim).map(str::to_string).collect();
        }
        if let Ok(v) = std::env::var("JOBFORGE_STRICT") {
            if let Ok(b) = v.parse() {
                config.strict = b;
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                config.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.shutdown_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_FETCH_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.fetch_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_AVERAGE_SCHEDULED_POLL_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                config.average_scheduled_poll_interval = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_DEAD_MAX_COUNT") {
            if let Ok(n) = v.parse() {
                config.dead_max_count = n;
            }
        }
        if let Ok(v) = std::env::var("JOBFORGE_REDIS_URL") {
            config.redis_url = v;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert!(config.strict);
        assert_eq!(config.max_retries, 25);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(25));
        assert_eq!(config.dead_max_count, 10_000);
    }

    #[test]
    fn from_env_overrides_concurrency() {
        std::env::set_var("JOBFORGE_CONCURRENCY", "4");
        let config = Config::from_env();
        assert_eq!(config.concurrency, 4);
        std::env::remove_var("JOBFORGE_CONCURRENCY");
    }

    #[test]
    fn from_env_parses_queue_list() {
        std::env::set_var("JOBFORGE_QUEUES", "critical, default, low");
        let config = Config::from_env();
        assert_eq!(config.queues, vec!["critical", "default", "low"]);
        std::env::remove_var("JOBFORGE_QUEUES");
    }
}
