// Module for session management
pub mod counters;
pub mod manager;
pub mod pool;
pub mod transaction;

pub use counters::{CountersSnapshot, OperationalCounters};
pub use manager::{OperationalStats, QueryOptions, SessionManager, SessionSettings};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use transaction::{
    TransactionContext, TransactionId, TransactionRegistry, TransactionState, TransactionSummary,
};
