//! Bounded connection pool.
//!
//! A semaphore with `max_size` permits gates checkouts: every connection that
//! is checked out, or being opened on behalf of a checkout, holds one permit.
//! New connections are only opened when the idle set is empty, so
//! `idle + in_use <= max_size` holds at all times. Waiters are served in FIFO
//! order by the semaphore and give up after the acquire timeout.
//!
//! The idle set lives behind a single mutex shared by checkout, check-in and
//! the idle sweep, so a sweep can never close a connection that a concurrent
//! checkout is handing out.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::driver::{ConnectionFactory, DatabaseConnection};
use crate::error::{Error, Result};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections the pool tries to keep open
    pub min_size: usize,
    /// Hard upper bound on open connections
    pub max_size: usize,
    /// Maximum time a caller waits for a connection
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed by the sweep
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Point-in-time view of the pool.
///
/// Advisory only: the numbers can be stale by the time the caller reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Acquires admitted but not yet holding a connection
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
    pub idle_timeout_ms: u64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquisitions: u64,
    pub acquire_timeouts: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    acquisitions: AtomicU64,
    acquire_timeouts: AtomicU64,
}

struct PoolEntry {
    id: u64,
    conn: Box<dyn DatabaseConnection>,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState {
    /// Longest-idle at the front; checkouts take from the back
    idle: VecDeque<PoolEntry>,
    /// Idle plus checked out plus being opened
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    drained: Notify,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl PoolInner {
    async fn open(&self, timeout: Duration) -> Result<PoolEntry> {
        let conn = match tokio::time::timeout(timeout, self.factory.connect()).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(Error::timeout(format!(
                    "opening a connection took longer than {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!("Opened pooled connection #{}", id);

        let now = Instant::now();
        Ok(PoolEntry {
            id,
            conn,
            created_at: now,
            idle_since: now,
        })
    }

    fn cancel_reservation(&self) {
        self.state.lock().total -= 1;
    }

    fn check_in(&self, mut entry: PoolEntry, broken: bool) {
        let mut state = self.state.lock();
        if broken || state.closed {
            state.total -= 1;
            drop(state);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Closing connection #{} ({})",
                entry.id,
                if broken { "broken" } else { "pool closed" }
            );
            return;
        }

        entry.idle_since = Instant::now();
        state.idle.push_back(entry);
    }
}

/// Counts an acquire from admission until it holds a connection, and
/// decrements however it ends, including when the acquiring future is dropped
struct WaitGuard<'a> {
    inner: &'a PoolInner,
}

impl<'a> WaitGuard<'a> {
    /// Admission and the closed check share the state lock, so once
    /// `shutdown` has marked the pool closed no new acquire is counted
    fn enter(inner: &'a PoolInner) -> Result<Self> {
        let state = inner.state.lock();
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        inner.waiting.fetch_add(1, Ordering::AcqRel);
        drop(state);
        Ok(Self { inner })
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.inner.waiting.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

enum Checkout {
    Idle(PoolEntry),
    Open,
}

/// Shared handle to the pool; clones refer to the same connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create an empty pool. Call [`ConnectionPool::ensure_min`] to pre-warm it.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let max_size = config.max_size.max(1);
        let config = PoolConfig {
            max_size,
            min_size: config.min_size.min(max_size),
            ..config
        };

        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_size),
                    total: 0,
                    closed: false,
                }),
                waiting: AtomicUsize::new(0),
                drained: Notify::new(),
                next_id: AtomicU64::new(0),
                counters: PoolCounters::default(),
                config,
                factory,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection, waiting up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Check out a connection, waiting up to `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;
        let _waiter = WaitGuard::enter(inner)?;

        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Err(_) => {
                inner.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                let stats = self.stats();
                warn!(
                    "Timed out after {}ms waiting for a connection ({} in use, {} waiting, max {})",
                    timeout.as_millis(),
                    stats.in_use,
                    stats.waiting,
                    stats.max
                );
                return Err(Error::pool_exhausted(format!(
                    "no connection available within {}ms ({} of {} in use)",
                    timeout.as_millis(),
                    stats.in_use,
                    stats.max
                )));
            }
        };

        let checkout = {
            let mut state = inner.state.lock();
            match state.idle.pop_back() {
                Some(entry) => Checkout::Idle(entry),
                None => {
                    state.total += 1;
                    Checkout::Open
                }
            }
        };

        let entry = match checkout {
            Checkout::Idle(entry) => entry,
            Checkout::Open => {
                let remaining = timeout.saturating_sub(started.elapsed());
                match inner.open(remaining.max(Duration::from_millis(1))).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        inner.cancel_reservation();
                        return Err(e);
                    }
                }
            }
        };

        inner.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Checked out connection #{} after {}ms",
            entry.id,
            started.elapsed().as_millis()
        );

        Ok(PooledConnection {
            entry: Some(entry),
            pool: self.inner.clone(),
            broken: false,
            _permit: permit,
        })
    }

    /// Open connections until the pool holds `min_size`. Stops at the first
    /// failure and reports it.
    pub async fn ensure_min(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut opened = 0;

        loop {
            let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
                break;
            };
            {
                let mut state = inner.state.lock();
                if state.closed || state.total >= inner.config.min_size {
                    break;
                }
                state.total += 1;
            }

            match inner.open(inner.config.acquire_timeout).await {
                Ok(entry) => {
                    inner.check_in(entry, false);
                    opened += 1;
                }
                Err(e) => {
                    inner.cancel_reservation();
                    return Err(e);
                }
            }
            drop(permit);
        }

        if opened > 0 {
            debug!("Opened {} connections to reach pool minimum", opened);
        }
        Ok(opened)
    }

    /// Close idle connections that have been idle longer than the idle
    /// timeout, never dropping below `min_size`. Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        let inner = &self.inner;
        let idle_timeout = inner.config.idle_timeout;

        let expired: Vec<PoolEntry> = {
            let mut state = inner.state.lock();
            let mut expired = Vec::new();
            while state.total > inner.config.min_size {
                let stale = state
                    .idle
                    .front()
                    .is_some_and(|entry| entry.idle_since.elapsed() >= idle_timeout);
                if !stale {
                    break;
                }
                if let Some(entry) = state.idle.pop_front() {
                    state.total -= 1;
                    expired.push(entry);
                }
            }
            expired
        };

        let closed = expired.len();
        if closed > 0 {
            inner
                .counters
                .closed
                .fetch_add(closed as u64, Ordering::Relaxed);
            for entry in &expired {
                debug!(
                    "Recycling idle connection #{} (age {}s)",
                    entry.id,
                    entry.created_at.elapsed().as_secs()
                );
            }
        }
        closed
    }

    /// Reject new acquires, wait for queued acquires to finish or time out,
    /// then close every idle connection. Connections still checked out are
    /// closed when they come back.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.state.lock().closed = true;

        let drained = async {
            loop {
                let notified = inner.drained.notified();
                if inner.waiting.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(inner.config.acquire_timeout, drained)
            .await
            .is_err()
        {
            warn!(
                "{} acquires still waiting at pool shutdown",
                inner.waiting.load(Ordering::Acquire)
            );
        }

        let (idle, in_use) = {
            let mut state = inner.state.lock();
            let idle: Vec<PoolEntry> = state.idle.drain(..).collect();
            state.total -= idle.len();
            (idle, state.total)
        };
        inner
            .counters
            .closed
            .fetch_add(idle.len() as u64, Ordering::Relaxed);

        info!(
            "Connection pool shut down: closed {} idle connections, {} still checked out",
            idle.len(),
            in_use
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let (total, idle) = {
            let state = inner.state.lock();
            (state.total, state.idle.len())
        };

        PoolStats {
            total,
            idle,
            in_use: total.saturating_sub(idle),
            waiting: inner.waiting.load(Ordering::Acquire),
            min: inner.config.min_size,
            max: inner.config.max_size,
            idle_timeout_ms: inner.config.idle_timeout.as_millis() as u64,
            connections_created: inner.counters.created.load(Ordering::Relaxed),
            connections_closed: inner.counters.closed.load(Ordering::Relaxed),
            acquisitions: inner.counters.acquisitions.load(Ordering::Relaxed),
            acquire_timeouts: inner.counters.acquire_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out connection, owned exclusively by its holder.
///
/// Returned to the pool when dropped; a connection marked broken is closed
/// instead.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    pool: Arc<PoolInner>,
    broken: bool,
    // released after the connection is back in the idle set
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Pool-assigned identifier, unique for the lifetime of the pool
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    pub fn age(&self) -> Duration {
        self.entry().created_at.elapsed()
    }

    /// Close this connection on release instead of reusing it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undo [`PooledConnection::mark_broken`]
    pub fn mark_healthy(&mut self) {
        self.broken = false;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the connection to the pool now
    pub fn release(self) {
        drop(self);
    }

    fn entry(&self) -> &PoolEntry {
        self.entry.as_ref().expect("connection already released")
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        self.entry().conn.as_ref()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry
            .as_mut()
            .expect("connection already released")
            .conn
            .as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.check_in(entry, self.broken);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .field("broken", &self.broken)
            .finish()
    }
}
