//! JSON-lines front end.
//!
//! Each input line is one request:
//!
//! ```json
//! {"id": 1, "client": "agent-7", "method": "query", "sql": "SELECT * FROM users WHERE id = ?", "params": [3]}
//! ```
//!
//! and produces exactly one output line carrying the same `id` and either a
//! `result` or an `error` with a stable `kind`. Requests are handled
//! concurrently, so responses can arrive out of order.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::retry::{RetryPolicy, with_retry};
use crate::session::{QueryOptions, SessionManager, TransactionId};

/// Rate limit identity for requests that do not name a client
pub const DEFAULT_CLIENT: &str = "default";

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(flatten)]
    pub call: Call,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Query {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(default)]
        options: QueryOptions,
    },
    BeginTransaction {
        #[serde(default)]
        read_only: bool,
    },
    QueryInTransaction {
        transaction_id: String,
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(default)]
        options: QueryOptions,
    },
    CommitTransaction {
        transaction_id: String,
    },
    RollbackTransaction {
        transaction_id: String,
    },
    PoolStats,
    OperationalStats,
    CacheInvalidate {
        #[serde(default)]
        pattern: Option<String>,
    },
}

impl Call {
    fn name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::BeginTransaction { .. } => "begin_transaction",
            Self::QueryInTransaction { .. } => "query_in_transaction",
            Self::CommitTransaction { .. } => "commit_transaction",
            Self::RollbackTransaction { .. } => "rollback_transaction",
            Self::PoolStats => "pool_stats",
            Self::OperationalStats => "operational_stats",
            Self::CacheInvalidate { .. } => "cache_invalidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        let (sqlstate, retry_after_ms) = match err {
            Error::InvalidStatement { sqlstate, .. } => (sqlstate.clone(), None),
            Error::RateLimitExceeded { retry_after_ms, .. } => (None, Some(*retry_after_ms)),
            _ => (None, None),
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            sqlstate,
            retry_after_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, err: &Error) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.into()),
        }
    }
}

/// Routes requests to the session manager
pub struct Dispatcher {
    manager: Arc<SessionManager>,
    retry: RetryPolicy,
    rate_limit: bool,
}

impl Dispatcher {
    pub fn new(manager: Arc<SessionManager>, retry: RetryPolicy, rate_limit: bool) -> Self {
        Self {
            manager,
            retry,
            rate_limit,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Parse and handle one input line
    pub async fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                // salvage the id so the caller can match the failure
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                let err = Error::InvalidStatement {
                    message: format!("malformed request: {e}"),
                    sqlstate: None,
                };
                Response::err(id, &err)
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let method = request.call.name();
        let client = request.client.as_deref().unwrap_or(DEFAULT_CLIENT);

        let outcome = match self.admit(client) {
            Ok(()) => self.call(request.call).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => Response::ok(request.id, result),
            Err(e) => {
                debug!("{} from {} failed: {}", method, client, e);
                Response::err(request.id, &e)
            }
        }
    }

    fn admit(&self, client: &str) -> Result<()> {
        if self.rate_limit {
            self.manager.rate_limit_check(client)
        } else {
            Ok(())
        }
    }

    async fn call(&self, call: Call) -> Result<Value> {
        let manager = &self.manager;
        match call {
            Call::Query {
                sql,
                params,
                options,
            } => {
                let result = with_retry(&self.retry, "query", || {
                    manager.query(&sql, &params, &options)
                })
                .await?;
                to_value(&result)
            }
            Call::BeginTransaction { read_only } => {
                let id = with_retry(&self.retry, "begin_transaction", || {
                    manager.begin_transaction(read_only)
                })
                .await?;
                Ok(json!({ "transaction_id": id }))
            }
            Call::QueryInTransaction {
                transaction_id,
                sql,
                params,
                options,
            } => {
                let id: TransactionId = transaction_id.parse()?;
                let result = manager
                    .query_in_transaction(&id, &sql, &params, &options)
                    .await?;
                to_value(&result)
            }
            Call::CommitTransaction { transaction_id } => {
                let id: TransactionId = transaction_id.parse()?;
                manager.commit_transaction(&id).await?;
                Ok(json!({ "transaction_id": id, "status": "committed" }))
            }
            Call::RollbackTransaction { transaction_id } => {
                let id: TransactionId = transaction_id.parse()?;
                manager.rollback_transaction(&id).await?;
                Ok(json!({ "transaction_id": id, "status": "rolled_back" }))
            }
            Call::PoolStats => to_value(&manager.pool_stats()),
            Call::OperationalStats => to_value(&manager.operational_stats()),
            Call::CacheInvalidate { pattern } => {
                let removed = manager.cache_invalidate(pattern.as_deref())?;
                Ok(json!({ "removed": removed }))
            }
        }
    }

    /// Serve requests from `reader` until end of input, writing responses to
    /// `writer`. Requests still running at end of input are awaited.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut in_flight = JoinSet::new();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let dispatcher = self.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                let response = dispatcher.handle_line(&line).await;
                match serde_json::to_string(&response) {
                    Ok(encoded) => {
                        let _ = tx.send(encoded);
                    }
                    Err(e) => warn!("Could not encode response: {}", e),
                }
            });

            // reap finished requests so the set does not grow without bound
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        drop(tx);

        writer_task
            .await
            .map_err(|e| std::io::Error::other(format!("response writer failed: {e}")))?
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::internal(format!("encoding result: {e}")))
}
