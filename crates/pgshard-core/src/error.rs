use thiserror::Error;

/// Error returned by a Postgres server, carried verbatim to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl BackendError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".into(),
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("checkout timeout: no connection available for {pool}")]
    PoolExhausted { pool: String },
    #[error("pooler is shutting down")]
    ShuttingDown,
    #[error("transaction is bound to shard(s) {bound}, statement routes to {requested}")]
    CrossShardTransaction { bound: String, requested: String },
    #[error("cannot execute {command} in a read-only transaction")]
    ReadOnlyTransactionViolation { command: String },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("cannot insert multiple commands into a prepared statement")]
    MultiStatementRejected,
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    TransactionAborted,
    #[error("{}", .0.message)]
    Backend(BackendError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl ProxyError {
    /// SQLSTATE reported to the client.
    pub fn sqlstate(&self) -> &str {
        match self {
            ProxyError::PoolExhausted { .. } => "53300",
            ProxyError::ShuttingDown => "57P01",
            ProxyError::CrossShardTransaction { .. } => "08P01",
            ProxyError::ReadOnlyTransactionViolation { .. } => "25006",
            ProxyError::BackendUnavailable(_) => "08006",
            ProxyError::MultiStatementRejected => "42601",
            ProxyError::TransactionAborted => "25P02",
            ProxyError::Backend(err) => &err.code,
            ProxyError::Protocol(_) => "08P01",
            ProxyError::Config(_) => "F0000",
            ProxyError::NotSupported(_) => "0A000",
        }
    }

    pub fn severity(&self) -> &str {
        match self {
            ProxyError::ShuttingDown => "FATAL",
            ProxyError::Backend(err) => &err.severity,
            _ => "ERROR",
        }
    }

    /// The client session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::ShuttingDown) || self.severity() == "FATAL"
    }

    /// The backend connection itself failed; it must not be reused.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ProxyError::BackendUnavailable(_))
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ProxyError::Backend(err) => err.detail.as_deref(),
            _ => None,
        }
    }
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        ProxyError::Backend(err)
    }
}
