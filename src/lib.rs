pub mod cache;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod query;
pub mod rate_limiter;
pub mod retry;
pub mod session;

pub use config::Config;
pub use driver::{ConnectionFactory, DatabaseConnection, DriverError, QueryResult};
pub use error::{Error, ErrorKind, Result};
pub use retry::{RetryPolicy, with_retry};
pub use session::{QueryOptions, SessionManager, TransactionId};
