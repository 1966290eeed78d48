//! Transactions that outlive a single call.
//!
//! A [`TransactionContext`] owns the pooled connection its transaction runs
//! on. Contexts live in the [`TransactionRegistry`] keyed by an opaque
//! [`TransactionId`] between calls; removing a context from the registry is
//! what makes later lookups fail with "not found".

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::pool::PooledConnection;
use crate::error::{Error, Result};

/// Opaque transaction handle given to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TransactionId {
    type Err = Error;

    /// A string that is not a valid id names no transaction
    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::transaction_not_found(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    /// A statement was abandoned mid-flight; only rollback is accepted
    Aborted,
    Committed,
    RolledBack,
}

/// Mutable part of a transaction, guarded by the context's async lock
#[derive(Debug)]
pub struct TransactionSession {
    /// Taken exactly once, by commit or rollback
    pub connection: Option<PooledConnection>,
    pub state: TransactionState,
    /// Tables written so far, invalidated in the result cache on commit
    pub written_tables: BTreeSet<String>,
}

impl TransactionSession {
    /// The connection of a transaction that has not ended yet
    pub fn active_connection(&mut self, id: &TransactionId) -> Result<&mut PooledConnection> {
        match (self.state, self.connection.as_mut()) {
            (TransactionState::Active, Some(conn)) => Ok(conn),
            (TransactionState::Aborted, Some(_)) => Err(Error::transaction_aborted(id)),
            _ => Err(Error::transaction_not_found(id)),
        }
    }

    /// Refuse further statements; the connection is discarded when the
    /// transaction ends
    pub fn abort(&mut self) {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Aborted;
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TransactionState::Aborted
    }
}

pub struct TransactionContext {
    pub id: TransactionId,
    pub read_only: bool,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    statements: AtomicU64,
    /// FIFO: concurrent calls on one transaction run one after another
    session: tokio::sync::Mutex<TransactionSession>,
}

impl TransactionContext {
    pub fn new(id: TransactionId, read_only: bool, connection: PooledConnection) -> Self {
        let now = Instant::now();
        Self {
            id,
            read_only,
            started_at: now,
            started_at_wall: Utc::now(),
            last_activity: Mutex::new(now),
            statements: AtomicU64::new(0),
            session: tokio::sync::Mutex::new(TransactionSession {
                connection: Some(connection),
                state: TransactionState::Active,
                written_tables: BTreeSet::new(),
            }),
        }
    }

    /// Wait for exclusive use of the transaction
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, TransactionSession> {
        self.session.lock().await
    }

    /// True while some call holds the session
    pub fn is_busy(&self) -> bool {
        self.session.try_lock().is_err()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn record_statement(&self) {
        self.statements.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn statement_count(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id,
            read_only: self.read_only,
            started_at: self.started_at_wall,
            age_ms: self.age().as_millis() as u64,
            idle_ms: self.idle_for().as_millis() as u64,
            statements: self.statement_count(),
        }
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .field("statements", &self.statement_count())
            .finish()
    }
}

/// Open transaction as reported in operational stats
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionSummary {
    pub id: TransactionId,
    pub read_only: bool,
    pub started_at: DateTime<Utc>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub statements: u64,
}

/// Open transactions by id
#[derive(Default)]
pub struct TransactionRegistry {
    contexts: Mutex<HashMap<TransactionId, Arc<TransactionContext>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context: Arc<TransactionContext>) {
        self.contexts.lock().insert(context.id, context);
    }

    pub fn get(&self, id: &TransactionId) -> Option<Arc<TransactionContext>> {
        self.contexts.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &TransactionId) -> Option<Arc<TransactionContext>> {
        self.contexts.lock().remove(id)
    }

    /// Remove and return every context
    pub fn drain(&self) -> Vec<Arc<TransactionContext>> {
        self.contexts.lock().drain().map(|(_, ctx)| ctx).collect()
    }

    /// Remove and return contexts idle for at least `timeout`. Contexts with a
    /// call in progress are left alone.
    pub fn remove_idle(&self, timeout: Duration) -> Vec<Arc<TransactionContext>> {
        let mut contexts = self.contexts.lock();
        let idle: Vec<TransactionId> = contexts
            .values()
            .filter(|ctx| ctx.idle_for() >= timeout && !ctx.is_busy())
            .map(|ctx| ctx.id)
            .collect();
        idle.iter().filter_map(|id| contexts.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }

    /// Open transactions, oldest first
    pub fn summaries(&self) -> Vec<TransactionSummary> {
        let mut summaries: Vec<TransactionSummary> = self
            .contexts
            .lock()
            .values()
            .map(|ctx| ctx.summary())
            .collect();
        summaries.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteConnectionFactory;
    use crate::error::ErrorKind;
    use crate::session::pool::{ConnectionPool, PoolConfig};

    async fn context(pool: &ConnectionPool) -> Arc<TransactionContext> {
        let conn = pool.acquire().await.unwrap();
        Arc::new(TransactionContext::new(TransactionId::new(), false, conn))
    }

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig::default().with_min_size(0).with_max_size(4),
            Arc::new(SqliteConnectionFactory::in_memory()),
        )
    }

    #[test]
    fn test_transaction_id_parsing() {
        let id = TransactionId::new();
        assert_eq!(id.to_string().parse::<TransactionId>().unwrap(), id);

        let err = "not-a-transaction".parse::<TransactionId>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_registry_lookup_after_remove() {
        let pool = pool();
        let registry = TransactionRegistry::new();
        let ctx = context(&pool).await;
        let id = ctx.id;

        registry.insert(ctx);
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.summaries().len(), 1);

        let removed = registry.remove(&id).unwrap();
        assert!(registry.get(&id).is_none());
        assert!(registry.remove(&id).is_none());

        let mut session = removed.lock().await;
        drop(session.connection.take());
        session.state = TransactionState::Committed;
        assert!(session.active_connection(&id).is_err());
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_aborted_session_refuses_statements() {
        let pool = pool();
        let ctx = context(&pool).await;
        let id = ctx.id;

        let mut session = ctx.lock().await;
        assert!(session.active_connection(&id).is_ok());
        session.abort();
        assert!(session.is_aborted());

        let err = session.active_connection(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatement);
        assert!(session.connection.is_some());
    }

    #[tokio::test]
    async fn test_remove_idle_skips_busy_contexts() {
        let pool = pool();
        let registry = TransactionRegistry::new();
        let busy = context(&pool).await;
        let idle = context(&pool).await;
        registry.insert(busy.clone());
        registry.insert(idle.clone());

        let _guard = busy.lock().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = registry.remove_idle(Duration::from_millis(10));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, idle.id);
        assert_eq!(registry.len(), 1);
    }
}
