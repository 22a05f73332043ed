use crate::coordinator::{ClusterContext, Coordinator};
use metrics::counter;
use pgshard_core::{BackendError, Column, ProxyError, QueryResult};
use pgshard_protocol::backend::write_messages;
use pgshard_protocol::frontend::read_message;
use pgshard_protocol::messages::{CloseTarget, DescribeTarget};
use pgshard_protocol::{BackendMessage, FrontendMessage};
use pgshard_router::{BindingInterceptor, Routed};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// One client connection to a cluster, after authentication.
///
/// Output is buffered and written on Sync, Flush, or at the end of a simple
/// query, so a pipelined batch of extended messages goes out in one write.
pub struct Session<S> {
    stream: S,
    coordinator: Coordinator,
    interceptor: BindingInterceptor,
    out: Vec<BackendMessage>,
    /// An extended-protocol message failed: ignore everything up to Sync.
    skipping: bool,
}

enum Flow {
    Continue,
    Close,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, cluster: Arc<ClusterContext>) -> Self {
        let interceptor = BindingInterceptor::new(cluster.router.clone());
        Self {
            stream,
            coordinator: Coordinator::new(cluster),
            interceptor,
            out: Vec::new(),
            skipping: false,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let result = self.serve().await;
        // Whatever state the client left behind, backends go back clean.
        self.coordinator.close().await;
        result
    }

    async fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            let msg = read_message(&mut self.stream).await?;
            if self.skipping && msg.is_extended() && msg != FrontendMessage::Sync {
                continue;
            }
            let flow = match msg {
                FrontendMessage::Query { sql } => self.simple_query(&sql).await?,
                FrontendMessage::Parse {
                    statement_name,
                    query,
                    param_oids,
                } => {
                    counter!("pgshard_queries_total", "protocol" => "extended").increment(1);
                    match self.interceptor.parse(&statement_name, &query, param_oids) {
                        Ok(()) => self.out.push(BackendMessage::ParseComplete),
                        Err(err) => self.extended_error(err).await,
                    }
                    Flow::Continue
                }
                FrontendMessage::Bind {
                    portal_name,
                    statement_name,
                    param_format_codes,
                    param_values,
                    result_format_codes,
                } => {
                    let bound = self
                        .interceptor
                        .bind(
                            &portal_name,
                            &statement_name,
                            param_format_codes,
                            param_values,
                            result_format_codes,
                        )
                        .map(|_| ());
                    match bound {
                        Ok(()) => self.out.push(BackendMessage::BindComplete),
                        Err(err) => self.extended_error(err).await,
                    }
                    Flow::Continue
                }
                FrontendMessage::Describe { target, name } => {
                    if let Err(err) = self.describe(target, &name).await {
                        self.extended_error(err).await;
                    }
                    Flow::Continue
                }
                FrontendMessage::Execute { portal_name, .. } => {
                    if let Err(err) = self.execute_portal(&portal_name).await {
                        self.extended_error(err).await;
                    }
                    Flow::Continue
                }
                FrontendMessage::Close { target, name } => {
                    match target {
                        CloseTarget::Statement => self.interceptor.close_statement(&name),
                        CloseTarget::Portal => self.interceptor.close_portal(&name),
                    }
                    self.out.push(BackendMessage::CloseComplete);
                    Flow::Continue
                }
                FrontendMessage::Flush => {
                    self.flush().await?;
                    Flow::Continue
                }
                FrontendMessage::Sync => {
                    self.skipping = false;
                    if self.coordinator.status() == pgshard_protocol::TransactionState::Idle {
                        self.interceptor.clear_portals();
                    }
                    self.ready().await?;
                    Flow::Continue
                }
                // Stray COPY messages after a failed COPY are dropped.
                FrontendMessage::CopyData { .. }
                | FrontendMessage::CopyDone
                | FrontendMessage::CopyFail { .. } => Flow::Continue,
                FrontendMessage::Terminate => Flow::Close,
                FrontendMessage::Unsupported { code } => {
                    let err = ProxyError::Protocol(format!(
                        "unsupported frontend message type '{}'",
                        code as char
                    ));
                    self.out.push(BackendMessage::error(&err));
                    self.ready().await?;
                    Flow::Continue
                }
                FrontendMessage::Password { .. }
                | FrontendMessage::Startup { .. }
                | FrontendMessage::SslRequest
                | FrontendMessage::CancelRequest { .. } => {
                    let err = ProxyError::Protocol("unexpected startup message".into());
                    self.out.push(BackendMessage::error(&err));
                    self.flush().await?;
                    Flow::Close
                }
            };
            if let Flow::Close = flow {
                self.flush().await?;
                return Ok(());
            }
        }
    }

    async fn simple_query(&mut self, sql: &str) -> anyhow::Result<Flow> {
        counter!("pgshard_queries_total", "protocol" => "simple").increment(1);
        let routed = match self.interceptor.simple_query(sql) {
            Ok(Some(routed)) => routed,
            Ok(None) => {
                self.out.push(BackendMessage::EmptyQueryResponse);
                self.ready().await?;
                return Ok(Flow::Continue);
            }
            Err(err) => {
                self.coordinator.abort_on(&err).await;
                return self.finish_with_error(err).await;
            }
        };
        if routed.analysis.copy.is_some() {
            return self.copy_in(&routed).await;
        }
        match self.coordinator.execute(&routed).await {
            Ok(result) => {
                self.push_result(result, true);
                self.ready().await?;
                Ok(Flow::Continue)
            }
            Err(err) => self.finish_with_error(err).await,
        }
    }

    async fn finish_with_error(&mut self, err: ProxyError) -> anyhow::Result<Flow> {
        debug!(error = %err, code = err.sqlstate(), "statement failed");
        self.out.push(BackendMessage::error(&err));
        if err.is_fatal() {
            self.flush().await?;
            return Ok(Flow::Close);
        }
        self.ready().await?;
        Ok(Flow::Continue)
    }

    async fn extended_error(&mut self, err: ProxyError) {
        debug!(error = %err, code = err.sqlstate(), "extended message failed");
        self.coordinator.abort_on(&err).await;
        self.out.push(BackendMessage::error(&err));
        self.skipping = true;
    }

    async fn describe(&mut self, target: DescribeTarget, name: &str) -> Result<(), ProxyError> {
        match target {
            DescribeTarget::Statement => {
                let statement = self.interceptor.statement(name).cloned().ok_or_else(|| {
                    ProxyError::Backend(BackendError::new(
                        "26000",
                        format!("prepared statement \"{name}\" does not exist"),
                    ))
                })?;
                let description = self
                    .coordinator
                    .describe(&statement.analysis, &statement.sql, &statement.param_oids)
                    .await?;
                self.out.push(BackendMessage::ParameterDescription {
                    oids: description.params,
                });
                self.push_row_description(description.columns);
            }
            DescribeTarget::Portal => {
                let portal = self.interceptor.portal(name).cloned().ok_or_else(|| missing_portal(name))?;
                let query = &portal.routed.query;
                let description = self
                    .coordinator
                    .describe(&portal.routed.analysis, &query.sql, &query.param_oids)
                    .await?;
                let columns = description
                    .columns
                    .into_iter()
                    .enumerate()
                    .map(|(i, column)| Column {
                        format: result_format(&query.result_formats, i),
                        ..column
                    })
                    .collect();
                self.push_row_description(columns);
            }
        }
        Ok(())
    }

    async fn execute_portal(&mut self, name: &str) -> Result<(), ProxyError> {
        let routed = self
            .interceptor
            .portal(name)
            .map(|portal| portal.routed.clone())
            .ok_or_else(|| missing_portal(name))?;
        if routed.analysis.copy.is_some() {
            return Err(ProxyError::NotSupported(
                "COPY over the extended query protocol".into(),
            ));
        }
        let result = self.coordinator.execute(&routed).await?;
        // RowDescription was already sent by Describe.
        self.push_result(result, false);
        Ok(())
    }

    /// Relay a `COPY ... FROM STDIN` until the client ends it.
    async fn copy_in(&mut self, routed: &Routed) -> anyhow::Result<Flow> {
        let start = match self.coordinator.copy_start(routed).await {
            Ok(start) => start,
            Err(err) => return self.finish_with_error(err).await,
        };
        let format = i8::from(start.binary);
        self.out.push(BackendMessage::CopyInResponse {
            format,
            columns: vec![i16::from(format); start.columns],
        });
        self.flush().await?;

        let mut failure: Option<ProxyError> = None;
        loop {
            match read_message(&mut self.stream).await? {
                FrontendMessage::CopyData { data } => {
                    if failure.is_none() {
                        if let Err(err) = self.coordinator.copy_data(&data).await {
                            failure = Some(err);
                        }
                    }
                }
                FrontendMessage::CopyDone => {
                    if failure.is_none() {
                        match self.coordinator.copy_done().await {
                            Ok(result) => self.push_result(result, false),
                            Err(err) => failure = Some(err),
                        }
                    }
                    break;
                }
                FrontendMessage::CopyFail { message } => {
                    let err = self.coordinator.copy_fail(&message).await;
                    failure.get_or_insert(err);
                    break;
                }
                FrontendMessage::Flush | FrontendMessage::Sync => {}
                FrontendMessage::Terminate => return Ok(Flow::Close),
                _ => {
                    let err = self
                        .coordinator
                        .copy_fail("unexpected message type during COPY")
                        .await;
                    warn!(error = %err, "client broke COPY protocol");
                    failure.get_or_insert(ProxyError::Protocol(
                        "unexpected message type during COPY from stdin".into(),
                    ));
                    break;
                }
            }
        }
        match failure {
            Some(err) => self.finish_with_error(err).await,
            None => {
                self.ready().await?;
                Ok(Flow::Continue)
            }
        }
    }

    fn push_row_description(&mut self, columns: Vec<Column>) {
        if columns.is_empty() {
            self.out.push(BackendMessage::NoData);
        } else {
            self.out.push(BackendMessage::RowDescription { fields: columns });
        }
    }

    fn push_result(&mut self, result: QueryResult, describe: bool) {
        if describe && !result.columns.is_empty() {
            self.out.push(BackendMessage::RowDescription {
                fields: result.columns,
            });
        }
        self.out.extend(
            result
                .rows
                .into_iter()
                .map(|row| BackendMessage::DataRow { values: row.values }),
        );
        if result.tag.is_empty() {
            self.out.push(BackendMessage::EmptyQueryResponse);
        } else {
            self.out.push(BackendMessage::CommandComplete { tag: result.tag });
        }
    }

    async fn ready(&mut self) -> anyhow::Result<()> {
        self.out.push(BackendMessage::ready(self.coordinator.status()));
        self.flush().await
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let out = std::mem::take(&mut self.out);
        write_messages(&mut self.stream, &out).await
    }
}

fn missing_portal(name: &str) -> ProxyError {
    ProxyError::Backend(BackendError::new(
        "34000",
        format!("portal \"{name}\" does not exist"),
    ))
}

fn result_format(formats: &[i16], index: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(index).copied().unwrap_or(0),
    }
}
