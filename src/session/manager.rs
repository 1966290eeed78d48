use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::counters::{CountersSnapshot, OperationalCounters};
use super::pool::{ConnectionPool, PoolStats, PooledConnection};
use super::transaction::{
    TransactionContext, TransactionId, TransactionRegistry, TransactionState, TransactionSummary,
};
use crate::cache::{CacheStats, ResultCache, ResultCacheKey, log_cache_status};
use crate::config::Config;
use crate::driver::{ConnectionFactory, QueryResult, Value};
use crate::error::{Error, ErrorKind, Result};
use crate::query::{StatementKind, is_read_only_query, written_table};
use crate::rate_limiter::{RateLimitStats, RateLimiter};

/// Behavior of the session manager that is not owned by one component
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Applied when a call does not set its own (zero disables)
    pub statement_timeout: Duration,
    /// How long past the statement timeout a statement may run before its
    /// connection is abandoned
    pub statement_grace: Duration,
    /// Transactions idle this long are rolled back (zero disables)
    pub transaction_timeout: Duration,
    pub cache_enabled: bool,
    pub pool_sweep_interval: Duration,
    pub rate_limit_sweep_interval: Duration,
    pub metrics_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            statement_grace: Duration::from_secs(1),
            transaction_timeout: Duration::from_secs(300),
            cache_enabled: true,
            pool_sweep_interval: Duration::from_secs(10),
            rate_limit_sweep_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(300),
        }
    }
}

/// Per-call execution options. Part of the result cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub timeout_ms: Option<u64>,
    pub use_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            use_cache: true,
        }
    }
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationalStats {
    #[serde(flatten)]
    pub counters: CountersSnapshot,
    pub live_connections: usize,
    pub active_transactions: usize,
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub rate_limiter: RateLimitStats,
    pub transactions: Vec<TransactionSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Rollback,
}

/// Entry point for every database operation.
///
/// One-shot queries hold a pooled connection for exactly one statement.
/// Transactions hold theirs from begin until commit or rollback, across
/// independent calls, addressed by [`TransactionId`].
pub struct SessionManager {
    pool: ConnectionPool,
    cache: Arc<ResultCache>,
    limiter: Arc<RateLimiter>,
    settings: SessionSettings,
    transactions: TransactionRegistry,
    counters: OperationalCounters,
    shut_down: AtomicBool,
    maintenance: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        pool: ConnectionPool,
        cache: Arc<ResultCache>,
        limiter: Arc<RateLimiter>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            pool,
            cache,
            limiter,
            settings,
            transactions: TransactionRegistry::new(),
            counters: OperationalCounters::new(),
            shut_down: AtomicBool::new(false),
            maintenance: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Build every component from configuration and open the minimum number
    /// of connections. Fails when the database cannot be reached.
    pub async fn from_config(config: &Config, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let pool = ConnectionPool::new(config.pool_config(), factory);
        let opened = pool.ensure_min().await?;
        info!(
            "Connection pool ready: {} connections (min {}, max {})",
            opened, config.pool_min_size, config.pool_max_size
        );

        Ok(Self::new(
            pool,
            Arc::new(ResultCache::new(config.cache_config())),
            Arc::new(RateLimiter::new(config.rate_limit_config())),
            config.session_settings(),
        ))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn statement_timeout(&self, options: &QueryOptions) -> Duration {
        options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.statement_timeout)
    }

    /// Run one statement outside any transaction.
    ///
    /// Read-only statements are served from the result cache when enabled.
    /// Writes invalidate cached results that read from the written table.
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        self.ensure_running()?;

        let cache_key = (self.settings.cache_enabled && options.use_cache && is_read_only_query(sql))
            .then(|| ResultCacheKey::new(sql, params, options));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                self.counters.record_cache_hit();
                debug!("Result cache hit for {}", key.fingerprint);
                return Ok(hit);
            }
        }

        let started = Instant::now();
        let outcome = self.run_one_shot(sql, params, options).await;
        self.counters.record_query(started.elapsed(), outcome.is_ok());
        let result = outcome?;

        match &cache_key {
            Some(key) => {
                self.cache.set(key, result.clone());
            }
            None => {
                if let Some(table) = written_table(sql) {
                    self.invalidate_table(&table);
                }
            }
        }

        Ok(result)
    }

    async fn run_one_shot(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let mut conn = self.pool.acquire().await?;
        let result = self
            .execute_on(&mut conn, sql, params, self.statement_timeout(options))
            .await;
        conn.release();
        result
    }

    /// Run one statement on a held connection.
    ///
    /// The connection counts as broken while the statement is in flight, so a
    /// dropped call never hands a busy connection back to the pool. A
    /// statement still running at timeout plus grace is abandoned along with
    /// its connection.
    async fn execute_on(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<QueryResult> {
        conn.mark_broken();
        conn.set_statement_timeout(timeout).await?;

        let outcome = if timeout.is_zero() {
            conn.execute(sql, params).await.map_err(Error::from)
        } else {
            let guard = timeout + self.settings.statement_grace;
            match tokio::time::timeout(guard, conn.execute(sql, params)).await {
                Ok(outcome) => outcome.map_err(Error::from),
                Err(_) => {
                    warn!(
                        "Statement on connection #{} still running after {}ms, abandoning the connection",
                        conn.id(),
                        guard.as_millis()
                    );
                    return Err(Error::timeout(format!(
                        "statement exceeded its {}ms timeout",
                        timeout.as_millis()
                    )));
                }
            }
        };

        match &outcome {
            Err(e) if e.kind() == ErrorKind::ConnectionFailure => {
                warn!("Discarding connection #{}: {}", conn.id(), e);
            }
            _ => conn.mark_healthy(),
        }
        outcome
    }

    /// Start a transaction on a dedicated connection and return its id
    pub async fn begin_transaction(&self, read_only: bool) -> Result<TransactionId> {
        self.ensure_running()?;

        let mut conn = self.pool.acquire().await?;
        conn.mark_broken();
        if let Err(e) = conn.begin(read_only).await {
            let err = Error::from(e);
            if err.kind() != ErrorKind::ConnectionFailure {
                conn.mark_healthy();
            }
            warn!("Failed to start transaction: {}", err);
            return Err(err);
        }
        conn.mark_healthy();

        let id = TransactionId::new();
        let context = Arc::new(TransactionContext::new(id, read_only, conn));
        self.transactions.insert(context);

        // cleanup may have drained the registry while the begin was running
        if self.is_shut_down() {
            if let Some(context) = self.transactions.remove(&id) {
                let _ = self.finish(&context, Outcome::Rollback).await;
            }
            return Err(Error::ShuttingDown);
        }

        self.counters.transaction_started();
        debug!(
            "Started {}transaction {}",
            if read_only { "read-only " } else { "" },
            id
        );
        Ok(id)
    }

    /// Run one statement inside an open transaction.
    ///
    /// Calls on the same transaction are served one at a time in arrival
    /// order. A call that was waiting while the transaction ended fails with
    /// [`Error::TransactionNotFound`].
    pub async fn query_in_transaction(
        &self,
        id: &TransactionId,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let context = self
            .transactions
            .get(id)
            .ok_or_else(|| Error::transaction_not_found(id))?;

        // the registry is the only owner of transaction boundaries
        if StatementKind::detect(sql).is_transaction_control() {
            self.counters.record_error();
            return Err(Error::InvalidStatement {
                message: format!(
                    "transaction {id} is ended with commit_transaction or rollback_transaction"
                ),
                sqlstate: Some("25000".to_string()),
            });
        }
        // reads only; PRAGMA, ATTACH and the like count as writes here
        if context.read_only && !is_read_only_query(sql) {
            self.counters.record_error();
            return Err(Error::permission_denied(format!(
                "transaction {id} is read-only"
            )));
        }

        context.touch();
        let mut session = context.lock().await;
        // still broken: an earlier call was dropped mid-statement
        if session.active_connection(id)?.is_broken() {
            session.abort();
            return Err(Error::transaction_aborted(id));
        }
        let conn = session.active_connection(id)?;

        let started = Instant::now();
        let outcome = self
            .execute_on(conn, sql, params, self.statement_timeout(options))
            .await;
        let abandoned = outcome.is_err() && conn.is_broken();
        self.counters.record_query(started.elapsed(), outcome.is_ok());
        context.record_statement();
        if abandoned {
            warn!("Transaction {} aborted, it only accepts rollback now", id);
            session.abort();
        }
        let result = outcome?;

        if let Some(table) = written_table(sql) {
            session.written_tables.insert(table);
        }
        Ok(result)
    }

    pub async fn commit_transaction(&self, id: &TransactionId) -> Result<()> {
        let context = self
            .transactions
            .remove(id)
            .ok_or_else(|| Error::transaction_not_found(id))?;
        self.finish(&context, Outcome::Commit).await
    }

    pub async fn rollback_transaction(&self, id: &TransactionId) -> Result<()> {
        let context = self
            .transactions
            .remove(id)
            .ok_or_else(|| Error::transaction_not_found(id))?;
        self.finish(&context, Outcome::Rollback).await
    }

    /// End a transaction that is already out of the registry. The connection
    /// goes back to the pool whatever the directive returns; it is reused only
    /// when the transaction is known to be closed on it.
    async fn finish(&self, context: &TransactionContext, outcome: Outcome) -> Result<()> {
        let mut session = context.lock().await;
        let Some(mut conn) = session.connection.take() else {
            return Err(Error::transaction_not_found(context.id));
        };
        conn.mark_broken();

        // an aborted transaction is rolled back even when asked to commit,
        // and its connection is never reused
        let aborted = session.is_aborted();
        let refused_commit = aborted && outcome == Outcome::Commit;
        let outcome = if aborted { Outcome::Rollback } else { outcome };

        let (result, closed) = match outcome {
            Outcome::Commit => match conn.commit().await {
                Ok(()) => (Ok(()), true),
                Err(e) => {
                    let err = Error::from(e);
                    warn!("Commit of transaction {} failed: {}", context.id, err);
                    let closed = match conn.rollback().await {
                        Ok(()) => true,
                        Err(rollback_err) => {
                            warn!(
                                "Rollback after failed commit of {} failed: {}",
                                context.id, rollback_err
                            );
                            false
                        }
                    };
                    (Err(err), closed)
                }
            },
            Outcome::Rollback => match conn.rollback().await {
                Ok(()) => (Ok(()), true),
                Err(e) => (Err(Error::from(e)), false),
            },
        };

        if closed && !aborted {
            conn.mark_healthy();
        }
        conn.release();
        let result = if refused_commit {
            Err(Error::transaction_aborted(context.id))
        } else {
            result
        };

        if outcome == Outcome::Commit && result.is_ok() {
            session.state = TransactionState::Committed;
            self.counters.transaction_committed();
            let written = std::mem::take(&mut session.written_tables);
            for table in &written {
                self.invalidate_table(table);
            }
            debug!(
                "Committed transaction {} ({} statements)",
                context.id,
                context.statement_count()
            );
        } else {
            session.state = TransactionState::RolledBack;
            self.counters.transaction_rolled_back();
            debug!("Rolled back transaction {}", context.id);
        }

        result
    }

    /// Roll back transactions idle longer than the transaction timeout
    pub async fn expire_idle_transactions(&self) -> usize {
        let timeout = self.settings.transaction_timeout;
        if timeout.is_zero() {
            return 0;
        }

        let expired = self.transactions.remove_idle(timeout);
        for context in &expired {
            warn!(
                "Transaction {} idle for {}s, rolling back",
                context.id,
                context.idle_for().as_secs()
            );
            if let Err(e) = self.finish(context, Outcome::Rollback).await {
                warn!("Rollback of expired transaction {} failed: {}", context.id, e);
            }
            self.counters.transaction_expired();
        }
        expired.len()
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn operational_stats(&self) -> OperationalStats {
        let pool = self.pool.stats();
        OperationalStats {
            counters: self.counters.snapshot(),
            live_connections: pool.total,
            active_transactions: self.transactions.len(),
            pool,
            cache: self.cache.stats(),
            rate_limiter: self.limiter.stats(),
            transactions: self.transactions.summaries(),
        }
    }

    pub fn cache_get(&self, sql: &str, params: &[Value], options: &QueryOptions) -> Option<QueryResult> {
        self.cache.get(&ResultCacheKey::new(sql, params, options))
    }

    pub fn cache_set(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
        result: QueryResult,
    ) -> bool {
        self.cache.set(&ResultCacheKey::new(sql, params, options), result)
    }

    /// Remove cached results matching `pattern`, or all of them
    pub fn cache_invalidate(&self, pattern: Option<&str>) -> Result<usize> {
        self.cache.invalidate_pattern(pattern)
    }

    fn invalidate_table(&self, table: &str) {
        match self.cache.invalidate_table(table) {
            Ok(0) => {}
            Ok(removed) => debug!("Write to {} invalidated {} cached results", table, removed),
            Err(e) => warn!("Could not invalidate cached results for {}: {}", table, e),
        }
    }

    pub fn rate_limit_admit(&self, identifier: &str) -> bool {
        self.limiter.admit(identifier)
    }

    pub fn rate_limit_check(&self, identifier: &str) -> Result<()> {
        self.limiter.check(identifier)
    }

    /// Roll back every open transaction, close the pool and stop background
    /// tasks. Later calls return immediately.
    pub async fn cleanup(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Session manager already shut down");
            return;
        }
        info!("Shutting down session manager");

        for handle in self.maintenance.lock().drain(..) {
            handle.abort();
        }

        let open = self.transactions.drain();
        if !open.is_empty() {
            info!("Rolling back {} open transactions", open.len());
        }
        for context in &open {
            if let Err(e) = self.finish(context, Outcome::Rollback).await {
                warn!("Rollback of transaction {} during shutdown failed: {}", context.id, e);
            }
        }

        self.pool.shutdown().await;
        self.log_status();
    }

    /// Log pool, cache and limiter status
    pub fn log_status(&self) {
        let pool = self.pool.stats();
        let counters = self.counters.snapshot();
        info!(
            "Session Status - Connections: {} ({} idle, {} in use, {} waiting, max {}), Transactions: {} open, Queries: {} ({} errors, avg {:.1}ms)",
            pool.total,
            pool.idle,
            pool.in_use,
            pool.waiting,
            pool.max,
            self.transactions.len(),
            counters.queries,
            counters.query_errors,
            counters.avg_latency_ms
        );
        log_cache_status(&self.cache);

        let limiter = self.limiter.stats();
        info!(
            "Rate Limiter Status - Clients: {}, Admitted: {}, Rejected: {}",
            limiter.tracked_identifiers, limiter.admitted, limiter.rejected
        );
    }

    /// Pool maintenance, cache expiry and the idle transaction reaper
    pub async fn housekeeping(&self) {
        let swept = self.pool.sweep_idle();
        if let Err(e) = self.pool.ensure_min().await {
            warn!("Could not replenish connection pool: {}", e);
        }
        let purged = self.cache.purge_expired();
        let expired = self.expire_idle_transactions().await;
        if swept + purged + expired > 0 {
            debug!(
                "Housekeeping: closed {} idle connections, purged {} cached results, expired {} transactions",
                swept, purged, expired
            );
        }
    }

    /// Start the periodic background tasks. They hold only a weak reference
    /// and stop on cleanup or when the manager is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }

        let tasks = [
            spawn_periodic(self, self.settings.pool_sweep_interval, |manager| async move {
                manager.housekeeping().await;
            }),
            spawn_periodic(self, self.settings.rate_limit_sweep_interval, |manager| async move {
                manager.limiter.sweep();
            }),
            spawn_periodic(self, self.settings.metrics_interval, |manager| async move {
                manager.log_status();
            }),
        ];
        self.maintenance.lock().extend(tasks.into_iter().flatten());
    }
}

fn spawn_periodic<F, Fut>(
    manager: &Arc<SessionManager>,
    period: Duration,
    task: F,
) -> Option<JoinHandle<()>>
where
    F: Fn(Arc<SessionManager>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        return None;
    }

    let manager = Arc::downgrade(manager);
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if manager.is_shut_down() {
                break;
            }
            task(manager).await;
        }
    }))
}
