//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::reliability::BackoffPolicy;
use crate::worker::PoolConfig;

/// Tunables shared by every task and subtask run
///
/// # Example
///
/// ```
/// use tasklane_durable::{BackoffPolicy, EngineConfig};
///
/// let config = EngineConfig::default()
///     .with_num_workers(8)
///     .with_default_retries(5)
///     .with_retry_backoff(BackoffPolicy::none());
/// assert_eq!(config.num_workers, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Worker pool size per subtask run
    pub num_workers: usize,

    /// Rows fetched per cursor page
    pub page_size: usize,

    /// Retry budget stamped on new subtasks
    pub default_retries: u32,

    /// Delay before a subtask retry pass
    pub retry_backoff: BackoffPolicy,

    /// Namespace of task lock scopes
    pub lock_namespace: String,

    /// Worker pool settings
    pub pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            page_size: 100,
            default_retries: 3,
            retry_backoff: BackoffPolicy::default(),
            lock_namespace: "tasks".to_string(),
            pool: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TASKLANE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let num_workers = env_parse("TASKLANE_NUM_WORKERS").unwrap_or(defaults.num_workers);
        let page_size = env_parse("TASKLANE_PAGE_SIZE").unwrap_or(defaults.page_size);
        let default_retries =
            env_parse("TASKLANE_DEFAULT_RETRIES").unwrap_or(defaults.default_retries);
        let lock_namespace =
            std::env::var("TASKLANE_LOCK_NAMESPACE").unwrap_or(defaults.lock_namespace);

        let mut pool = defaults.pool;
        if let Some(ms) = env_parse::<u64>("TASKLANE_CALL_TIMEOUT_MS") {
            pool = pool.with_call_timeout(std::time::Duration::from_millis(ms));
        }

        Self {
            num_workers,
            page_size,
            default_retries,
            lock_namespace,
            pool,
            ..defaults
        }
        .normalized()
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_lock_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.lock_namespace = namespace.into();
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    fn normalized(mut self) -> Self {
        self.num_workers = self.num_workers.max(1);
        self.page_size = self.page_size.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
