use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    ConnectionFactory, DatabaseConnection, DriverError, DriverResult, FieldInfo, QueryResult,
    Value,
};

/// Opens SQLite connections with the pragmas the pool expects.
///
/// With no path every connection gets its own private in-memory database,
/// which is only useful for tests that never share data between connections.
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    path: Option<String>,
    journal_mode: String,
    synchronous: String,
    cache_size: i32,
    busy_timeout: Duration,
}

impl SqliteConnectionFactory {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: -64000,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            journal_mode: "MEMORY".to_string(),
            ..Self::new(":memory:")
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_pragmas(
        mut self,
        journal_mode: impl Into<String>,
        synchronous: impl Into<String>,
        cache_size: i32,
    ) -> Self {
        self.journal_mode = journal_mode.into();
        self.synchronous = synchronous.into();
        self.cache_size = cache_size;
        self
    }

    fn open(&self) -> DriverResult<Connection> {
        let conn = match &self.path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(map_sqlite_error)?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = {};
             PRAGMA cache_size = {};
             PRAGMA temp_store = MEMORY;",
            self.journal_mode, self.synchronous, self.cache_size
        ))
        .map_err(map_sqlite_error)?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(map_sqlite_error)?;

        Ok(conn)
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self) -> DriverResult<Box<dyn DatabaseConnection>> {
        let factory = self.clone();
        let conn = tokio::task::spawn_blocking(move || factory.open())
            .await
            .map_err(|e| DriverError::with_sqlstate("08006", format!("connect task failed: {e}")))??;

        debug!(
            "Opened SQLite connection to {}",
            self.path.as_deref().unwrap_or(":memory:")
        );
        Ok(Box::new(SqliteConnection::new(conn)))
    }
}

/// A single SQLite link.
///
/// Statements run on the blocking pool. The statement timeout is enforced by
/// interrupting the running statement, which SQLite reports as
/// `SQLITE_INTERRUPT` and this driver reports as SQLSTATE `57014`.
pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    statement_timeout: Duration,
    query_only: bool,
}

impl SqliteConnection {
    fn new(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            statement_timeout: Duration::ZERO,
            query_only: false,
        }
    }

    async fn run<F, R>(&self, work: F) -> DriverResult<R>
    where
        F: FnOnce(&Connection) -> DriverResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        let timeout = self.statement_timeout;
        let deadline = Instant::now() + timeout;

        let mut task = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            if !timeout.is_zero() && Instant::now() >= deadline {
                return Err(DriverError::with_sqlstate(
                    "57014",
                    "canceling statement due to statement timeout",
                ));
            }
            work(&conn)
        });

        let joined = if timeout.is_zero() {
            task.await
        } else {
            tokio::select! {
                joined = &mut task => joined,
                _ = tokio::time::sleep(timeout) => {
                    debug!("Statement exceeded {}ms, interrupting", timeout.as_millis());
                    self.interrupt.interrupt();
                    task.await
                }
            }
        };

        joined.map_err(|e| DriverError::new(format!("statement task failed: {e}")))?
    }

    async fn run_batch(&self, sql: &'static str) -> DriverResult<()> {
        self.run(move |conn| conn.execute_batch(sql).map_err(map_sqlite_error))
            .await
    }

    async fn leave_query_only(&mut self) -> DriverResult<()> {
        if self.query_only {
            self.query_only = false;
            self.run_batch("PRAGMA query_only = OFF;").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for SqliteConnection {
    async fn set_statement_timeout(&mut self, timeout: Duration) -> DriverResult<()> {
        self.statement_timeout = timeout;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult> {
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        self.run(move |conn| run_statement(conn, &sql, &params)).await
    }

    async fn begin(&mut self, read_only: bool) -> DriverResult<()> {
        if read_only {
            self.run_batch("BEGIN; PRAGMA query_only = ON;").await?;
            self.query_only = true;
            Ok(())
        } else {
            self.run_batch("BEGIN;").await
        }
    }

    async fn commit(&mut self) -> DriverResult<()> {
        let committed = self.run_batch("COMMIT;").await;
        let reset = self.leave_query_only().await;
        committed.and(reset)
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        let rolled_back = self.run_batch("ROLLBACK;").await;
        let reset = self.leave_query_only().await;
        rolled_back.and(reset)
    }
}

fn run_statement(conn: &Connection, sql: &str, params: &[SqlValue]) -> DriverResult<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let command = leading_keyword(sql);

    if stmt.column_count() == 0 {
        let affected = stmt
            .execute(rusqlite::params_from_iter(params.iter()))
            .map_err(map_sqlite_error)?;
        return Ok(QueryResult::command_only(command, affected as u64));
    }

    let fields: Vec<FieldInfo> = stmt
        .columns()
        .iter()
        .map(|column| FieldInfo {
            name: column.name().to_string(),
            data_type: column.decl_type().map(str::to_string),
        })
        .collect();

    let width = fields.len();
    let mut rows = Vec::new();
    let mut cursor = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(map_sqlite_error)?;
    while let Some(row) = cursor.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_value_ref(row.get_ref(i).map_err(map_sqlite_error)?));
        }
        rows.push(values);
    }

    Ok(QueryResult {
        row_count: rows.len() as u64,
        rows,
        fields,
        command,
        duration_ms: 0,
    })
}

fn leading_keyword(sql: &str) -> String {
    sql.split(|c: char| c.is_whitespace() || c == ';' || c == '(')
        .find(|word| !word.is_empty())
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// Map a rusqlite failure onto a PostgreSQL-style SQLSTATE
fn map_sqlite_error(err: rusqlite::Error) -> DriverError {
    let message = err.to_string();
    let sqlstate = match &err {
        rusqlite::Error::SqliteFailure(failure, detail) => match failure.code {
            ErrorCode::OperationInterrupted => "57014",
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => "55P03",
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => "08001",
            ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => "42501",
            ErrorCode::ReadOnly => "25006",
            ErrorCode::ConstraintViolation => "23000",
            ErrorCode::TypeMismatch => "42804",
            ErrorCode::TooBig => "54000",
            ErrorCode::OutOfMemory | ErrorCode::DiskFull => "53000",
            ErrorCode::DatabaseCorrupt | ErrorCode::SystemIoFailure => "XX001",
            ErrorCode::Unknown => classify_generic_error(detail.as_deref().unwrap_or(&message)),
            _ => "XX000",
        },
        rusqlite::Error::InvalidParameterCount(..) | rusqlite::Error::InvalidParameterName(_) => {
            "42P02"
        }
        rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..) => {
            "42804"
        }
        rusqlite::Error::MultipleStatement => "42601",
        _ => "XX000",
    };
    DriverError::with_sqlstate(sqlstate, message)
}

/// `SQLITE_ERROR` covers everything from typos to missing tables; the only
/// discriminator is the message text
fn classify_generic_error(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no such table") || lower.contains("no such view") {
        "42P01"
    } else if lower.contains("no such column") {
        "42703"
    } else if lower.contains("no such function") {
        "42883"
    } else if lower.contains("syntax error") || lower.contains("incomplete input") {
        "42601"
    } else if lower.contains("already exists") {
        "42P07"
    } else if lower.contains("cannot start a transaction within a transaction")
        || lower.contains("no transaction is active")
    {
        "25000"
    } else {
        "42000"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connect() -> Box<dyn DatabaseConnection> {
        SqliteConnectionFactory::in_memory().connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let mut conn = connect().await;
        conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let inserted = conn
            .execute("INSERT INTO users (name) VALUES (?1), (?2)", &[json!("alice"), json!("bob")])
            .await
            .unwrap();
        assert_eq!(inserted.command, "INSERT");
        assert_eq!(inserted.row_count, 2);

        let result = conn
            .execute("SELECT id, name FROM users WHERE name = ?1", &[json!("bob")])
            .await
            .unwrap();
        assert_eq!(result.command, "SELECT");
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows, vec![vec![json!(2), json!("bob")]]);
        assert_eq!(result.fields[1].name, "name");
        assert_eq!(result.fields[1].data_type.as_deref(), Some("TEXT"));
    }

    #[tokio::test]
    async fn test_missing_table_maps_to_sqlstate() {
        let mut conn = connect().await;
        let err = conn.execute("SELECT * FROM missing", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("42P01"));

        let err = conn.execute("SELEC 1", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("42601"));
    }

    #[tokio::test]
    async fn test_read_only_transaction_blocks_writes() {
        let mut conn = connect().await;
        conn.execute("CREATE TABLE t (x INTEGER)", &[]).await.unwrap();

        conn.begin(true).await.unwrap();
        let err = conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("25006"));
        conn.rollback().await.unwrap();

        // query_only is reset once the transaction ends
        conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_statement_timeout_interrupts() {
        let mut conn = connect().await;
        conn.set_statement_timeout(Duration::from_millis(50)).await.unwrap();

        let err = conn
            .execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c",
                &[],
            )
            .await
            .unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("57014"));

        // The link stays usable after an interrupted statement
        let ok = conn.execute("SELECT 1", &[]).await.unwrap();
        assert_eq!(ok.rows, vec![vec![json!(1)]]);
        assert!(conn.is_valid().await);
    }

    #[tokio::test]
    async fn test_unreachable_path_is_connection_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing").join("db.sqlite");
        let err = match SqliteConnectionFactory::new(path.to_string_lossy()).connect().await {
            Ok(_) => panic!("opened a database in a missing directory"),
            Err(e) => e,
        };
        assert_eq!(err.sqlstate.as_deref(), Some("08001"));
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(to_sql_value(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".to_string()));
        assert_eq!(from_value_ref(ValueRef::Blob(&[0xde, 0xad])), json!("dead"));
    }
}
