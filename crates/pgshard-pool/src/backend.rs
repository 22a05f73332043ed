use async_trait::async_trait;
use pgshard_core::{Description, ProxyError, Query, QueryResult, Role, ShardId};
use pgshard_protocol::TransactionState;
use std::fmt;

/// Where a pool connects to, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub shard: ShardId,
    pub role: Role,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{} [shard {} {}]",
            self.user, self.host, self.port, self.database, self.shard, self.role
        )
    }
}

/// A live session on a Postgres server.
///
/// Every call runs to completion (through ReadyForQuery) before it returns,
/// so a connection is never left mid-message between calls. Sessions hold
/// these across awaits inside spawned tasks, hence `Sync`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&mut self, query: &Query) -> Result<QueryResult, ProxyError>;

    async fn describe(&mut self, sql: &str, param_oids: &[i32])
        -> Result<Description, ProxyError>;

    /// Start a `COPY ... FROM STDIN`; returns once the server is ready for data.
    async fn copy_in(&mut self, sql: &str) -> Result<(), ProxyError>;

    async fn copy_data(&mut self, data: &[u8]) -> Result<(), ProxyError>;

    async fn copy_done(&mut self) -> Result<QueryResult, ProxyError>;

    async fn copy_fail(&mut self, message: &str) -> Result<(), ProxyError>;

    fn transaction_state(&self) -> TransactionState;

    fn in_copy(&self) -> bool;

    fn is_broken(&self) -> bool;

    /// Idle, not in a transaction, not in COPY.
    fn is_clean(&self) -> bool {
        !self.is_broken() && !self.in_copy() && self.transaction_state() == TransactionState::Idle
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Backend>, ProxyError>;
}

/// Stand-in left behind in a guard once its connection was handed back.
pub(crate) struct Detached;

#[async_trait]
impl Backend for Detached {
    async fn execute(&mut self, _query: &Query) -> Result<QueryResult, ProxyError> {
        Err(detached())
    }

    async fn describe(
        &mut self,
        _sql: &str,
        _param_oids: &[i32],
    ) -> Result<Description, ProxyError> {
        Err(detached())
    }

    async fn copy_in(&mut self, _sql: &str) -> Result<(), ProxyError> {
        Err(detached())
    }

    async fn copy_data(&mut self, _data: &[u8]) -> Result<(), ProxyError> {
        Err(detached())
    }

    async fn copy_done(&mut self) -> Result<QueryResult, ProxyError> {
        Err(detached())
    }

    async fn copy_fail(&mut self, _message: &str) -> Result<(), ProxyError> {
        Err(detached())
    }

    fn transaction_state(&self) -> TransactionState {
        TransactionState::Idle
    }

    fn in_copy(&self) -> bool {
        false
    }

    fn is_broken(&self) -> bool {
        true
    }
}

fn detached() -> ProxyError {
    ProxyError::BackendUnavailable("connection already returned to the pool".into())
}
