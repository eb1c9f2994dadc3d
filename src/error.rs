use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a tool call. Every variant is surfaced to the caller
/// as an [`ErrorRecord`]; none of them takes the server down.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no connection became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("connection pool is shut down")]
    PoolClosed,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("query failed{}: {message}", engine_code(.code))]
    QueryError { code: Option<String>, message: String },

    #[error("statement exceeded the {0:?} execution limit")]
    Timeout(Duration),

    #[error("unsupported statement: {0}")]
    UnsupportedStatement(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid argument '{param}': {reason}")]
    InvalidArgument { param: String, reason: String },
}

impl ToolError {
    pub fn invalid_argument(param: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidArgument {
            param: param.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::PoolExhausted(_) => "PoolExhausted",
            ToolError::PoolClosed => "PoolClosed",
            ToolError::ConnectionError(_) => "ConnectionError",
            ToolError::QueryError { .. } => "QueryError",
            ToolError::Timeout(_) => "Timeout",
            ToolError::UnsupportedStatement(_) => "UnsupportedStatement",
            ToolError::UnknownTool(_) => "UnknownTool",
            ToolError::InvalidArgument { .. } => "InvalidArgument",
        }
    }

    /// True for failures detected before any connection is leased.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ToolError::UnsupportedStatement(_)
                | ToolError::UnknownTool(_)
                | ToolError::InvalidArgument { .. }
        )
    }

    /// JSON-RPC error code used when this error is sent over the wire.
    pub fn rpc_code(&self) -> i32 {
        match self {
            ToolError::InvalidArgument { .. } | ToolError::UnsupportedStatement(_) => -32602,
            ToolError::UnknownTool(_) => -32601,
            ToolError::ConnectionError(_) | ToolError::PoolClosed => -32003,
            ToolError::QueryError { .. } => -32004,
            ToolError::PoolExhausted(_) => -32005,
            ToolError::Timeout(_) => -32006,
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        let cause = match self {
            ToolError::QueryError { code: Some(code), .. } => Some(format!("engine error {code}")),
            ToolError::InvalidArgument { param, .. } => Some(format!("parameter {param}")),
            _ => None,
        };
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            cause,
        }
    }
}

fn engine_code(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

/// Structured error shape returned to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Failure raised by a [`DbConnection`](crate::pool::DbConnection).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// The link itself is broken; the handle must not be reused.
    #[error("{0}")]
    Connection(String),

    /// The engine rejected the statement; the link is still usable.
    #[error("{message}")]
    Statement { code: Option<String>, message: String },
}

impl DriverError {
    pub fn is_connection(&self) -> bool {
        matches!(self, DriverError::Connection(_))
    }
}

impl From<DriverError> for ToolError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Connection(msg) => ToolError::ConnectionError(msg),
            DriverError::Statement { code, message } => ToolError::QueryError { code, message },
        }
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => DriverError::Statement {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DriverError::Connection(e.to_string()),
            other => DriverError::Statement {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_keeps_engine_message() {
        let err = ToolError::from(DriverError::Statement {
            code: Some("1064".into()),
            message: "You have an error in your SQL syntax".into(),
        });
        assert_eq!(err.kind(), "QueryError");
        assert_eq!(
            err.to_string(),
            "query failed (1064): You have an error in your SQL syntax"
        );
        let record = err.to_record();
        assert_eq!(record.cause.as_deref(), Some("engine error 1064"));
    }

    #[test]
    fn test_validation_kinds() {
        assert!(ToolError::UnknownTool("x".into()).is_validation());
        assert!(ToolError::invalid_argument("table", "bad").is_validation());
        assert!(!ToolError::PoolClosed.is_validation());
        assert!(!ToolError::Timeout(Duration::from_secs(1)).is_validation());
    }

    #[test]
    fn test_record_serialization_omits_empty_cause() {
        let value = serde_json::to_value(ToolError::PoolClosed.to_record()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"kind": "PoolClosed", "message": "connection pool is shut down"})
        );
    }

    #[test]
    fn test_io_error_is_connection_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DriverError::from(sqlx::Error::Io(io));
        assert!(err.is_connection());
    }
}
