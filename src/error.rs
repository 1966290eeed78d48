//! Error taxonomy for the session core.
//!
//! Driver failures are classified exactly once, in `From<DriverError>`, and
//! travel upward as [`Error`] with a stable [`ErrorKind`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::driver::DriverError;

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure kinds visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConnectionFailure,
    Timeout,
    PoolExhausted,
    InvalidStatement,
    PermissionDenied,
    NotFound,
    RateLimitExceeded,
    Internal,
}

impl ErrorKind {
    /// Only transient infrastructure failures are worth another attempt
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure | Self::Timeout | Self::PoolExhausted
        )
    }

    /// Stable identifier for wire responses
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConnectionFailure => "CONNECTION_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::PoolExhausted => "POOL_EXHAUSTED",
            Self::InvalidStatement => "INVALID_STATEMENT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection failure: {message}")]
    ConnectionFailure {
        message: String,
        #[source]
        source: Option<DriverError>,
    },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("connection pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("invalid statement: {message}")]
    InvalidStatement {
        message: String,
        sqlstate: Option<String>,
    },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// The id is unknown, already committed or rolled back, or expired
    #[error("transaction not found: {id}")]
    TransactionNotFound { id: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("rate limit exceeded for {identifier}, retry in {retry_after_ms}ms")]
    RateLimitExceeded {
        identifier: String,
        retry_after_ms: u64,
    },

    #[error("session manager is shutting down")]
    ShuttingDown,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailure { .. } => ErrorKind::ConnectionFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::InvalidStatement { .. } => ErrorKind::InvalidStatement,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::TransactionNotFound { .. } | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::ShuttingDown | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn transaction_not_found(id: impl fmt::Display) -> Self {
        Self::TransactionNotFound { id: id.to_string() }
    }

    /// A transaction that can only be rolled back
    pub fn transaction_aborted(id: impl fmt::Display) -> Self {
        Self::InvalidStatement {
            message: format!(
                "transaction {id} is aborted, commands ignored until rollback_transaction"
            ),
            sqlstate: Some("25P02".to_string()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        let kind = classify(&err);
        let message = err.message.clone();
        match kind {
            ErrorKind::ConnectionFailure => Self::ConnectionFailure {
                message,
                source: Some(err),
            },
            ErrorKind::Timeout => Self::Timeout { message },
            ErrorKind::PoolExhausted => Self::PoolExhausted { message },
            ErrorKind::InvalidStatement => Self::InvalidStatement {
                message,
                sqlstate: err.sqlstate,
            },
            ErrorKind::PermissionDenied => Self::PermissionDenied { message },
            ErrorKind::NotFound => Self::NotFound { message },
            ErrorKind::RateLimitExceeded | ErrorKind::Internal => Self::Internal { message },
        }
    }
}

/// Map a driver failure onto the taxonomy.
///
/// The SQLSTATE decides when present; the message text is a fallback for
/// drivers that only report prose.
pub fn classify(err: &DriverError) -> ErrorKind {
    if let Some(kind) = err.sqlstate.as_deref().and_then(classify_sqlstate) {
        return kind;
    }
    classify_message(&err.message)
}

fn classify_sqlstate(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        // query_canceled, lock_not_available, idle_in_transaction_session_timeout
        "57014" | "55P03" | "25P03" => ErrorKind::Timeout,
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => ErrorKind::ConnectionFailure,
        // too_many_connections
        "53300" => ErrorKind::PoolExhausted,
        // insufficient_privilege, read_only_sql_transaction
        "42501" | "25006" => ErrorKind::PermissionDenied,
        // undefined_table, undefined_column, undefined_function,
        // invalid_catalog_name, invalid_schema_name, undefined_object
        "42P01" | "42703" | "42883" | "3D000" | "3F000" | "42704" => ErrorKind::NotFound,
        _ => match code.get(..2)? {
            "08" => ErrorKind::ConnectionFailure,
            "28" => ErrorKind::PermissionDenied,
            "22" | "23" | "25" | "26" | "2B" | "34" | "40" | "42" | "0A" => {
                ErrorKind::InvalidStatement
            }
            "53" | "54" | "55" | "57" | "58" | "XX" => ErrorKind::Internal,
            _ => return None,
        },
    };
    Some(kind)
}

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out", "canceling statement"]) {
        ErrorKind::Timeout
    } else if has(&[
        "connection refused",
        "connection reset",
        "connection terminated",
        "broken pipe",
        "econnrefused",
        "could not connect",
    ]) {
        ErrorKind::ConnectionFailure
    } else if has(&["too many connections", "pool exhausted"]) {
        ErrorKind::PoolExhausted
    } else if has(&["permission denied", "not authorized", "readonly", "read-only"]) {
        ErrorKind::PermissionDenied
    } else if has(&["does not exist", "no such table", "not found"]) {
        ErrorKind::NotFound
    } else if has(&["syntax error", "invalid input", "violates"]) {
        ErrorKind::InvalidStatement
    } else {
        ErrorKind::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::ConnectionFailure.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::PoolExhausted.is_retryable());

        assert!(!ErrorKind::InvalidStatement.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::RateLimitExceeded.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn test_classify_by_sqlstate() {
        let cases = [
            ("08006", ErrorKind::ConnectionFailure),
            ("57014", ErrorKind::Timeout),
            ("53300", ErrorKind::PoolExhausted),
            ("42601", ErrorKind::InvalidStatement),
            ("23505", ErrorKind::InvalidStatement),
            ("42501", ErrorKind::PermissionDenied),
            ("42P01", ErrorKind::NotFound),
            ("XX000", ErrorKind::Internal),
        ];
        for (code, expected) in cases {
            let err = DriverError::with_sqlstate(code, "boom");
            assert_eq!(classify(&err), expected, "sqlstate {code}");
        }
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(
            classify(&DriverError::new("connect ECONNREFUSED 127.0.0.1:5432")),
            ErrorKind::ConnectionFailure
        );
        assert_eq!(
            classify(&DriverError::new("Query read timeout")),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify(&DriverError::new("relation \"foo\" does not exist")),
            ErrorKind::NotFound
        );
        assert_eq!(
            classify(&DriverError::new("something odd happened")),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_transaction_not_found_is_distinct() {
        let err = Error::transaction_not_found("abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err, Error::TransactionNotFound { .. }));
        assert_eq!(err.to_string(), "transaction not found: abc");
        assert_eq!(Error::ShuttingDown.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_driver_error_conversion_keeps_sqlstate() {
        let err: Error = DriverError::with_sqlstate("42601", "syntax error at or near \"SELEC\"").into();
        match err {
            Error::InvalidStatement { sqlstate, .. } => assert_eq!(sqlstate.as_deref(), Some("42601")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
