#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use sqlgate::cache::{CacheConfig, ResultCache};
use sqlgate::driver::{
    ConnectionFactory, DatabaseConnection, DriverError, DriverResult, FieldInfo, QueryResult,
    Value,
};
use sqlgate::rate_limiter::{RateLimitConfig, RateLimiter};
use sqlgate::session::{ConnectionPool, PoolConfig, SessionManager, SessionSettings};

/// Shared script and journal for every connection a [`MockConnectionFactory`] opens
#[derive(Default)]
pub struct MockState {
    statements: Mutex<Vec<(usize, String)>>,
    errors: Mutex<VecDeque<DriverError>>,
    delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    timeouts: Mutex<Vec<Duration>>,
    pub opened: AtomicUsize,
    pub dropped: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    /// Let statements run past the statement timeout, like a driver that
    /// cannot cancel
    pub ignore_timeout: AtomicBool,
}

impl MockState {
    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().iter().map(|(_, sql)| sql.clone()).collect()
    }

    /// Statements executed on one connection
    pub fn statements_on(&self, connection: usize) -> Vec<String> {
        self.statements
            .lock()
            .iter()
            .filter(|(id, _)| *id == connection)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|(_, sql)| sql.to_ascii_uppercase().starts_with(prefix))
            .count()
    }

    /// Fail the next statement with `error`
    pub fn push_error(&self, error: DriverError) {
        self.errors.lock().push_back(error);
    }

    /// Make every statement take `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Make every connect take `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Statement timeouts applied to connections, in order
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().clone()
    }
}

#[derive(Clone, Default)]
pub struct MockConnectionFactory {
    pub state: Arc<MockState>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self) -> DriverResult<Box<dyn DatabaseConnection>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::with_sqlstate(
                "08001",
                "could not connect to server: Connection refused",
            ));
        }
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            id,
            state: self.state.clone(),
            timeout: Duration::ZERO,
        }))
    }
}

pub struct MockConnection {
    id: usize,
    state: Arc<MockState>,
    timeout: Duration,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> DriverResult<()> {
        self.state.timeouts.lock().push(timeout);
        self.timeout = timeout;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult> {
        self.state.statements.lock().push((self.id, sql.to_string()));
        let upper = sql.trim().to_ascii_uppercase();

        if let Some(err) = self.state.errors.lock().pop_front() {
            return Err(err);
        }
        if upper.starts_with("BEGIN") && self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(DriverError::with_sqlstate(
                "25001",
                "cannot start a transaction within a transaction",
            ));
        }
        if upper == "COMMIT" && self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DriverError::with_sqlstate(
                "40001",
                "could not serialize access due to concurrent update",
            ));
        }
        if upper == "ROLLBACK" && self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DriverError::with_sqlstate("08006", "connection reset by peer"));
        }

        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            if !self.timeout.is_zero()
                && delay > self.timeout
                && !self.state.ignore_timeout.load(Ordering::SeqCst)
            {
                tokio::time::sleep(self.timeout).await;
                return Err(DriverError::with_sqlstate(
                    "57014",
                    "canceling statement due to statement timeout",
                ));
            }
            tokio::time::sleep(delay).await;
        }

        let command = upper.split_whitespace().next().unwrap_or("").to_string();
        if command == "SELECT" {
            Ok(QueryResult {
                rows: vec![vec![json!(self.id), Value::Array(params.to_vec())]],
                row_count: 1,
                fields: vec![
                    FieldInfo {
                        name: "connection".to_string(),
                        data_type: Some("INTEGER".to_string()),
                    },
                    FieldInfo {
                        name: "params".to_string(),
                        data_type: None,
                    },
                ],
                command,
                duration_ms: delay.as_millis() as u64,
            })
        } else {
            Ok(QueryResult::command_only(command, 1))
        }
    }
}

pub fn pool_config(max: usize) -> PoolConfig {
    PoolConfig::default()
        .with_min_size(0)
        .with_max_size(max)
        .with_acquire_timeout(Duration::from_millis(500))
        .with_idle_timeout(Duration::from_secs(30))
}

/// Settings without background intervals, for tests that drive maintenance
/// by hand
pub fn settings() -> SessionSettings {
    SessionSettings {
        statement_timeout: Duration::from_secs(5),
        statement_grace: Duration::from_millis(200),
        transaction_timeout: Duration::from_secs(300),
        cache_enabled: true,
        pool_sweep_interval: Duration::ZERO,
        rate_limit_sweep_interval: Duration::ZERO,
        metrics_interval: Duration::ZERO,
    }
}

pub fn manager_with(
    factory: &MockConnectionFactory,
    pool: PoolConfig,
    settings: SessionSettings,
) -> SessionManager {
    SessionManager::new(
        ConnectionPool::new(pool, Arc::new(factory.clone())),
        Arc::new(ResultCache::new(CacheConfig::default())),
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        settings,
    )
}

/// A manager over the mock driver with at most `max` connections
pub fn manager(max: usize) -> (SessionManager, Arc<MockState>) {
    let factory = MockConnectionFactory::new();
    let manager = manager_with(&factory, pool_config(max), settings());
    (manager, factory.state)
}
