use clap::Parser;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::driver::SqliteConnectionFactory;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::session::{PoolConfig, SessionSettings};

#[derive(Parser, Debug, Clone)]
#[command(name = "sqlgate")]
#[command(about = "sqlgate - pooled, rate-limited database sessions for tool-calling clients\nReads JSON requests from stdin, one per line, and writes one JSON response per line", long_about = None)]
pub struct Config {
    // Basic configuration
    #[arg(short, long, default_value = "sqlgate.db", env = "SQLGATE_DATABASE")]
    pub database: String,

    #[arg(long, env = "SQLGATE_IN_MEMORY", help = "Use a private in-memory SQLite database per connection (for testing only)")]
    pub in_memory: bool,

    #[arg(long, default_value = "info", env = "SQLGATE_LOG_LEVEL")]
    pub log_level: String,

    // Connection pool
    #[arg(long, default_value = "2", env = "SQLGATE_POOL_MIN_SIZE", help = "Connections opened at startup and kept open")]
    pub pool_min_size: usize,

    #[arg(long, default_value = "10", env = "SQLGATE_POOL_MAX_SIZE", help = "Maximum number of open connections")]
    pub pool_max_size: usize,

    #[arg(long, default_value = "30000", env = "SQLGATE_POOL_ACQUIRE_TIMEOUT_MS", help = "How long a caller waits for a free connection in milliseconds")]
    pub pool_acquire_timeout_ms: u64,

    #[arg(long, default_value = "30", env = "SQLGATE_POOL_IDLE_TIMEOUT", help = "Idle connections above the minimum are closed after this many seconds")]
    pub pool_idle_timeout: u64,

    #[arg(long, default_value = "10", env = "SQLGATE_POOL_SWEEP_INTERVAL", help = "Interval for the idle connection sweep in seconds")]
    pub pool_sweep_interval: u64,

    // Statements and transactions
    #[arg(long, default_value = "30000", env = "SQLGATE_STATEMENT_TIMEOUT_MS", help = "Default statement timeout in milliseconds (0 disables)")]
    pub statement_timeout_ms: u64,

    #[arg(long, default_value = "1000", env = "SQLGATE_STATEMENT_GRACE_MS", help = "Extra time allowed past the statement timeout before the connection is abandoned")]
    pub statement_grace_ms: u64,

    #[arg(long, default_value = "300", env = "SQLGATE_TRANSACTION_TIMEOUT", help = "Transactions idle for this many seconds are rolled back (0 disables)")]
    pub transaction_timeout: u64,

    // Result cache
    #[arg(long, env = "SQLGATE_NO_RESULT_CACHE", help = "Disable the result cache for one-shot reads")]
    pub no_result_cache: bool,

    #[arg(long, default_value = "1000", env = "SQLGATE_RESULT_CACHE_SIZE", help = "Maximum number of result sets to cache")]
    pub result_cache_size: usize,

    #[arg(long, default_value = "300", env = "SQLGATE_RESULT_CACHE_TTL", help = "TTL for result cache entries in seconds")]
    pub result_cache_ttl: u64,

    #[arg(long, default_value = "1048576", env = "SQLGATE_RESULT_CACHE_MAX_ENTRY_BYTES", help = "Results larger than this are not cached (default: 1MB)")]
    pub result_cache_max_entry_bytes: usize,

    // Rate limiting
    #[arg(long, env = "SQLGATE_NO_RATE_LIMIT", help = "Disable per-client rate limiting")]
    pub no_rate_limit: bool,

    #[arg(long, default_value = "100", env = "SQLGATE_RATE_LIMIT_REQUESTS", help = "Requests admitted per client per window")]
    pub rate_limit_requests: u32,

    #[arg(long, default_value = "60", env = "SQLGATE_RATE_LIMIT_WINDOW", help = "Rate limit window in seconds")]
    pub rate_limit_window: u64,

    #[arg(long, default_value = "60", env = "SQLGATE_RATE_LIMIT_SWEEP_INTERVAL", help = "Interval for discarding ended rate limit windows in seconds")]
    pub rate_limit_sweep_interval: u64,

    // Retry
    #[arg(long, default_value = "3", env = "SQLGATE_RETRY_MAX_ATTEMPTS", help = "Attempts for retryable failures, including the first")]
    pub retry_max_attempts: u32,

    #[arg(long, default_value = "1000", env = "SQLGATE_RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,

    #[arg(long, default_value = "30000", env = "SQLGATE_RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    #[arg(long, default_value = "0.1", env = "SQLGATE_RETRY_JITTER", help = "Random extra backoff as a fraction of the delay")]
    pub retry_jitter: f64,

    // Observability
    #[arg(long, default_value = "300", env = "SQLGATE_METRICS_INTERVAL", help = "Interval for logging pool and cache status in seconds (0 disables)")]
    pub metrics_interval: u64,

    // SQLite PRAGMA settings
    #[arg(long, default_value = "WAL", env = "SQLGATE_JOURNAL_MODE", help = "SQLite journal mode (WAL, DELETE, TRUNCATE, etc.)")]
    pub pragma_journal_mode: String,

    #[arg(long, default_value = "NORMAL", env = "SQLGATE_SYNCHRONOUS", help = "SQLite synchronous mode (NORMAL, FULL, OFF)")]
    pub pragma_synchronous: String,

    #[arg(long, default_value = "-64000", env = "SQLGATE_CACHE_SIZE", allow_hyphen_values = true, help = "SQLite page cache size in KB (negative for KB, positive for pages)")]
    pub pragma_cache_size: i32,

    #[arg(long, default_value = "5000", env = "SQLGATE_BUSY_TIMEOUT_MS", help = "How long SQLite waits on a locked database in milliseconds")]
    pub busy_timeout_ms: u64,
}

impl Default for Config {
    /// Defaults plus whatever the environment sets
    fn default() -> Self {
        Config::parse_from(["sqlgate"])
    }
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_min_size(self.pool_min_size)
            .with_max_size(self.pool_max_size)
            .with_acquire_timeout(Duration::from_millis(self.pool_acquire_timeout_ms))
            .with_idle_timeout(Duration::from_secs(self.pool_idle_timeout))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.result_cache_size,
            ttl: self.result_cache_ttl_duration(),
            max_entry_bytes: self.result_cache_max_entry_bytes,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_requests,
            window: Duration::from_secs(self.rate_limit_window),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry_max_attempts)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_jitter(self.retry_jitter)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            statement_timeout: Duration::from_millis(self.statement_timeout_ms),
            statement_grace: Duration::from_millis(self.statement_grace_ms),
            transaction_timeout: Duration::from_secs(self.transaction_timeout),
            cache_enabled: !self.no_result_cache,
            pool_sweep_interval: Duration::from_secs(self.pool_sweep_interval),
            rate_limit_sweep_interval: Duration::from_secs(self.rate_limit_sweep_interval),
            metrics_interval: self.metrics_interval_duration(),
        }
    }

    pub fn connection_factory(&self) -> SqliteConnectionFactory {
        let factory = if self.in_memory {
            SqliteConnectionFactory::in_memory()
        } else {
            SqliteConnectionFactory::new(self.database.clone()).with_pragmas(
                self.pragma_journal_mode.clone(),
                self.pragma_synchronous.clone(),
                self.pragma_cache_size,
            )
        };
        factory.with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }

    /// Get the result cache TTL as Duration
    pub fn result_cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.result_cache_ttl)
    }

    /// Get the metrics interval as Duration
    pub fn metrics_interval_duration(&self) -> Duration {
        Duration::from_secs(self.metrics_interval)
    }
}
