use crate::server::ShutdownSignal;
use pgshard_core::{Column, DataRow, ProxyError, QueryResult};
use pgshard_pool::PoolManager;
use pgshard_protocol::backend::write_messages;
use pgshard_protocol::frontend::read_message;
use pgshard_protocol::{BackendMessage, FrontendMessage, TransactionState};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Commands accepted on the admin database. Autocommit only.
pub struct AdminConsole {
    pools: Arc<PoolManager>,
    shutdown: Arc<ShutdownSignal>,
}

impl AdminConsole {
    pub fn new(pools: Arc<PoolManager>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self { pools, shutdown }
    }

    pub async fn execute(&self, sql: &str) -> Result<QueryResult, ProxyError> {
        let command = sql.trim().trim_end_matches(';').trim();
        let words: Vec<String> = command
            .split_whitespace()
            .map(|w| w.to_ascii_uppercase())
            .collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["SHOW", "POOLS"] => Ok(self.show_pools()),
            ["SHOW", "VERSION"] => Ok(QueryResult {
                columns: vec![Column::text("version")],
                rows: vec![DataRow::new().add(format!("pgshard {}", env!("CARGO_PKG_VERSION")))],
                tag: "SHOW".into(),
            }),
            ["SHUTDOWN"] => {
                info!("shutdown requested from admin console");
                self.pools.shutdown(None);
                self.shutdown.trigger();
                Ok(QueryResult::command("SHUTDOWN"))
            }
            ["RECONNECT"] => {
                self.pools.reconnect(None).await;
                Ok(QueryResult::command("RECONNECT"))
            }
            ["RECONNECT", _] => {
                // Cluster names are case sensitive; take the original word.
                let cluster = command.split_whitespace().nth(1).unwrap_or_default();
                if !self.pools.has_cluster(cluster) {
                    return Err(ProxyError::Config(format!("unknown cluster \"{cluster}\"")));
                }
                self.pools.reconnect(Some(cluster)).await;
                Ok(QueryResult::command("RECONNECT"))
            }
            ["BEGIN", ..] | ["START", "TRANSACTION", ..] => Err(ProxyError::NotSupported(
                "transactions on the admin console".into(),
            )),
            [] => Ok(QueryResult::command("")),
            _ => Err(ProxyError::NotSupported(format!("admin command \"{command}\""))),
        }
    }

    fn show_pools(&self) -> QueryResult {
        let columns = vec![
            Column::text("database"),
            Column::text("user"),
            Column::text("host"),
            Column::bigint("port"),
            Column::bigint("shard"),
            Column::text("role"),
            Column::bigint("cl_waiting"),
            Column::bigint("sv_idle"),
            Column::bigint("sv_active"),
            Column::bigint("sv_total"),
            Column::bigint("maxwait_ms"),
            Column::bigint("errors"),
            Column::bigint("out_of_sync"),
            Column::bool("online"),
        ];
        let rows = self
            .pools
            .stats()
            .into_iter()
            .map(|(cluster, stats)| {
                DataRow::new()
                    .add(cluster)
                    .add(&stats.address.user)
                    .add(&stats.address.host)
                    .add(stats.address.port)
                    .add(stats.address.shard)
                    .add(stats.address.role)
                    .add(stats.cl_waiting)
                    .add(stats.sv_idle)
                    .add(stats.sv_active)
                    .add(stats.sv_total)
                    .add(stats.maxwait.as_millis())
                    .add(stats.errors)
                    .add(stats.out_of_sync)
                    .add(if stats.online { "t" } else { "f" })
            })
            .collect();
        QueryResult::rows(columns, rows)
    }

    /// Simple-query loop for an authenticated admin connection.
    pub async fn serve<S>(&self, stream: &mut S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let msg = read_message(stream).await?;
            let mut out = Vec::new();
            match msg {
                FrontendMessage::Query { sql } => match self.execute(&sql).await {
                    Ok(result) if result.tag.is_empty() => {
                        out.push(BackendMessage::EmptyQueryResponse);
                    }
                    Ok(result) => {
                        if !result.columns.is_empty() {
                            out.push(BackendMessage::RowDescription {
                                fields: result.columns,
                            });
                        }
                        out.extend(
                            result
                                .rows
                                .into_iter()
                                .map(|row| BackendMessage::DataRow { values: row.values }),
                        );
                        out.push(BackendMessage::CommandComplete { tag: result.tag });
                    }
                    Err(err) => {
                        warn!(error = %err, "admin command failed");
                        out.push(BackendMessage::error(&err));
                    }
                },
                FrontendMessage::Terminate => return Ok(()),
                FrontendMessage::Sync => {}
                _ => {
                    let err = ProxyError::NotSupported(
                        "extended query protocol on the admin console".into(),
                    );
                    out.push(BackendMessage::error(&err));
                }
            }
            out.push(BackendMessage::ready(TransactionState::Idle));
            write_messages(stream, &out).await?;
        }
    }
}
