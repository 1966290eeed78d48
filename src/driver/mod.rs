//! Database driver seam.
//!
//! The session core never talks to a concrete database directly. It holds
//! boxed [`DatabaseConnection`] values created by a [`ConnectionFactory`];
//! failures come back as opaque [`DriverError`]s which are classified once
//! at the boundary (see [`crate::error`]).

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use serde_json::Value;
pub use sqlite::SqliteConnectionFactory;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A failure reported by the driver, before classification.
///
/// `sqlstate` follows the PostgreSQL five-character convention when the
/// driver can provide one; the classifier falls back to the message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sqlstate: None,
            message: message.into(),
        }
    }

    pub fn with_sqlstate(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: Some(sqlstate.into()),
            message: message.into(),
        }
    }
}

/// Column metadata returned with a result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    /// Declared type, when the driver knows it
    pub data_type: Option<String>,
}

/// Result of a single statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows as positional values, in `fields` order
    pub rows: Vec<Vec<Value>>,
    /// Rows returned for queries, rows affected for DML
    pub row_count: u64,
    pub fields: Vec<FieldInfo>,
    /// Leading SQL keyword, upper-cased (`SELECT`, `INSERT`, ...)
    pub command: String,
    pub duration_ms: u64,
}

impl QueryResult {
    /// Result of a statement that returns no rows
    pub fn command_only(command: impl Into<String>, row_count: u64) -> Self {
        Self {
            rows: Vec::new(),
            row_count,
            fields: Vec::new(),
            command: command.into(),
            duration_ms: 0,
        }
    }

    /// Rough in-memory footprint, used for cache accounting
    pub fn approximate_size(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|f| f.name.len() + f.data_type.as_ref().map_or(0, String::len))
            .sum();
        let rows: usize = self
            .rows
            .iter()
            .flat_map(|row| row.iter())
            .map(value_size)
            .sum();
        fields + rows + self.command.len() + std::mem::size_of::<Self>()
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
    }
}

/// One live link to the database.
///
/// Dropping the value closes the link.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Apply a statement timeout to every following statement on this link,
    /// replacing any previous value
    async fn set_statement_timeout(&mut self, timeout: Duration) -> DriverResult<()>;

    /// Run one statement
    async fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult>;

    /// Start a transaction, optionally read-only
    async fn begin(&mut self, read_only: bool) -> DriverResult<()> {
        let sql = if read_only {
            "BEGIN TRANSACTION READ ONLY"
        } else {
            "BEGIN"
        };
        self.execute(sql, &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    /// Cheap liveness probe
    async fn is_valid(&mut self) -> bool {
        self.execute("SELECT 1", &[]).await.is_ok()
    }
}

/// Opens new connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> DriverResult<Box<dyn DatabaseConnection>>;
}
