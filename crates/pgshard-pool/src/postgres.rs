use crate::backend::{Address, Backend, Connector};
use async_trait::async_trait;
use pgshard_core::{BackendError, Description, ProxyError, Query, QueryResult};
use pgshard_protocol::backend::read_backend_message;
use pgshard_protocol::frontend::write_frontend;
use pgshard_protocol::messages::DescribeTarget;
use pgshard_protocol::{BackendMessage, ErrorFields, FrontendMessage, TransactionState};
use std::collections::HashMap;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens [`PgConnection`]s over TCP.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    pub application_name: String,
}

impl PgConnector {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Backend>, ProxyError> {
        let conn = PgConnection::connect(addr, &self.application_name).await?;
        Ok(Box::new(conn))
    }
}

/// A session on a real Postgres server.
pub struct PgConnection {
    stream: BufStream<TcpStream>,
    state: TransactionState,
    in_copy: bool,
    broken: bool,
    params: HashMap<String, String>,
    key: Option<(i32, i32)>,
}

impl PgConnection {
    pub async fn connect(addr: &Address, application_name: &str) -> Result<Self, ProxyError> {
        let tcp = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("{addr}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| ProxyError::BackendUnavailable(format!("{addr}: {e}")))?;
        let mut conn = Self {
            stream: BufStream::new(tcp),
            state: TransactionState::Idle,
            in_copy: false,
            broken: false,
            params: HashMap::new(),
            key: None,
        };

        let mut params = HashMap::new();
        params.insert("user".to_string(), addr.user.clone());
        params.insert("database".to_string(), addr.database.clone());
        if !application_name.is_empty() {
            params.insert("application_name".to_string(), application_name.to_string());
        }
        conn.send(&[FrontendMessage::Startup { params }]).await?;

        loop {
            match conn.recv().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = addr.password.clone().unwrap_or_default();
                    conn.send(&[FrontendMessage::Password { password }]).await?;
                }
                BackendMessage::AuthenticationMd5Password { salt } => {
                    let password = md5_password(
                        &addr.user,
                        addr.password.as_deref().unwrap_or_default(),
                        &salt,
                    );
                    conn.send(&[FrontendMessage::Password { password }]).await?;
                }
                BackendMessage::AuthenticationOther { code } => {
                    return Err(ProxyError::NotSupported(format!(
                        "server authentication method {code}"
                    )));
                }
                BackendMessage::ParameterStatus { key, value } => {
                    conn.params.insert(key, value);
                }
                BackendMessage::BackendKeyData { pid, secret } => conn.key = Some((pid, secret)),
                BackendMessage::ErrorResponse { fields } => return Err(backend_error(fields)),
                BackendMessage::ReadyForQuery { state } => {
                    conn.state = state;
                    break;
                }
                _ => {}
            }
        }
        debug!(
            %addr,
            server_version = conn.params.get("server_version").map_or("", String::as_str),
            pid = conn.key.map_or(0, |(pid, _)| pid),
            "server connection ready"
        );
        Ok(conn)
    }

    async fn send(&mut self, messages: &[FrontendMessage]) -> Result<(), ProxyError> {
        if let Err(err) = write_frontend(&mut self.stream, messages).await {
            self.broken = true;
            return Err(ProxyError::BackendUnavailable(err.to_string()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<BackendMessage, ProxyError> {
        match read_backend_message(&mut self.stream).await {
            Ok(msg) => Ok(msg),
            Err(err) => {
                self.broken = true;
                Err(ProxyError::BackendUnavailable(err.to_string()))
            }
        }
    }

    /// Collect a statement's results through ReadyForQuery.
    async fn read_result(&mut self) -> Result<QueryResult, ProxyError> {
        let mut result = QueryResult::default();
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::RowDescription { fields } => result.columns = fields,
                BackendMessage::DataRow { values } => {
                    result.rows.push(pgshard_core::DataRow { values })
                }
                BackendMessage::CommandComplete { tag } => result.tag = tag,
                BackendMessage::EmptyQueryResponse => result.tag.clear(),
                BackendMessage::ErrorResponse { fields } => {
                    if error.is_none() {
                        error = Some(backend_error(fields));
                    }
                }
                BackendMessage::CopyInResponse { .. } => {
                    self.send(&[FrontendMessage::CopyFail {
                        message: "COPY is not expected here".into(),
                    }])
                    .await?;
                }
                BackendMessage::CopyOutResponse { .. } => {
                    error.get_or_insert(ProxyError::NotSupported("COPY TO STDOUT".into()));
                }
                BackendMessage::ParameterStatus { key, value } => {
                    self.params.insert(key, value);
                }
                BackendMessage::ReadyForQuery { state } => {
                    self.state = state;
                    break;
                }
                _ => {}
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }
}

#[async_trait]
impl Backend for PgConnection {
    async fn execute(&mut self, query: &Query) -> Result<QueryResult, ProxyError> {
        if query.extended || !query.params.is_empty() {
            self.send(&[
                FrontendMessage::Parse {
                    statement_name: String::new(),
                    query: query.sql.clone(),
                    param_oids: query.param_oids.clone(),
                },
                FrontendMessage::Bind {
                    portal_name: String::new(),
                    statement_name: String::new(),
                    param_format_codes: query.param_formats.clone(),
                    param_values: query.params.clone(),
                    result_format_codes: query.result_formats.clone(),
                },
                FrontendMessage::Describe {
                    target: DescribeTarget::Portal,
                    name: String::new(),
                },
                FrontendMessage::Execute {
                    portal_name: String::new(),
                    max_rows: 0,
                },
                FrontendMessage::Sync,
            ])
            .await?;
        } else {
            self.send(&[FrontendMessage::Query {
                sql: query.sql.clone(),
            }])
            .await?;
        }
        self.read_result().await
    }

    async fn describe(
        &mut self,
        sql: &str,
        param_oids: &[i32],
    ) -> Result<Description, ProxyError> {
        self.send(&[
            FrontendMessage::Parse {
                statement_name: String::new(),
                query: sql.to_string(),
                param_oids: param_oids.to_vec(),
            },
            FrontendMessage::Describe {
                target: DescribeTarget::Statement,
                name: String::new(),
            },
            FrontendMessage::Sync,
        ])
        .await?;
        let mut description = Description::default();
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::ParameterDescription { oids } => description.params = oids,
                BackendMessage::RowDescription { fields } => description.columns = fields,
                BackendMessage::ErrorResponse { fields } => {
                    error.get_or_insert(backend_error(fields));
                }
                BackendMessage::ReadyForQuery { state } => {
                    self.state = state;
                    break;
                }
                _ => {}
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(description),
        }
    }

    async fn copy_in(&mut self, sql: &str) -> Result<(), ProxyError> {
        self.send(&[FrontendMessage::Query {
            sql: sql.to_string(),
        }])
        .await?;
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::CopyInResponse { .. } => {
                    self.in_copy = true;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    error.get_or_insert(backend_error(fields));
                }
                BackendMessage::ReadyForQuery { state } => {
                    self.state = state;
                    return Err(error.unwrap_or_else(|| {
                        ProxyError::Protocol("server did not enter COPY mode".into())
                    }));
                }
                _ => {}
            }
        }
    }

    async fn copy_data(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        self.send(&[FrontendMessage::CopyData {
            data: data.to_vec(),
        }])
        .await
    }

    async fn copy_done(&mut self) -> Result<QueryResult, ProxyError> {
        self.send(&[FrontendMessage::CopyDone]).await?;
        self.in_copy = false;
        self.read_result().await
    }

    async fn copy_fail(&mut self, message: &str) -> Result<(), ProxyError> {
        self.send(&[FrontendMessage::CopyFail {
            message: message.to_string(),
        }])
        .await?;
        self.in_copy = false;
        // The server answers CopyFail with an error; that is the expected outcome.
        match self.read_result().await {
            Ok(_) | Err(ProxyError::Backend(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn transaction_state(&self) -> TransactionState {
        self.state
    }

    fn in_copy(&self) -> bool {
        self.in_copy
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

fn backend_error(fields: ErrorFields) -> ProxyError {
    ProxyError::Backend(BackendError {
        severity: fields.severity,
        code: fields.code,
        message: fields.message,
        detail: fields.detail,
    })
}

/// `md5` || md5(md5(password || user) || salt), as Postgres expects.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut salted = inner.into_bytes();
    salted.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(salted))
}
