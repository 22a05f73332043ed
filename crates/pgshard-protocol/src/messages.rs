use pgshard_core::{Column, ProxyError};
use std::collections::HashMap;

pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Messages a client sends, and that the proxy forwards to servers.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    Startup { params: HashMap<String, String> },
    /// SSLRequest or GSSENCRequest; both are declined.
    SslRequest,
    CancelRequest { pid: i32, secret: i32 },
    Password { password: String },
    Query { sql: String },
    Parse {
        statement_name: String,
        query: String,
        param_oids: Vec<i32>,
    },
    Bind {
        portal_name: String,
        statement_name: String,
        param_format_codes: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_format_codes: Vec<i16>,
    },
    Describe {
        target: DescribeTarget,
        name: String,
    },
    /// `max_rows` of 0 means no limit.
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    Close {
        target: CloseTarget,
        name: String,
    },
    Flush,
    Sync,
    CopyData { data: Vec<u8> },
    CopyDone,
    CopyFail { message: String },
    Terminate,
    /// Type code we do not decode.
    Unsupported { code: u8 },
}

impl FrontendMessage {
    /// Messages that belong to an extended-protocol batch ending in Sync.
    pub fn is_extended(&self) -> bool {
        matches!(
            self,
            FrontendMessage::Parse { .. }
                | FrontendMessage::Bind { .. }
                | FrontendMessage::Describe { .. }
                | FrontendMessage::Execute { .. }
                | FrontendMessage::Close { .. }
                | FrontendMessage::Flush
                | FrontendMessage::Sync
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTarget {
    Statement,
    Portal,
}

/// Status byte of ReadyForQuery as the client sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    Transaction,
    Error,
}

impl TransactionState {
    pub fn wire_byte(self) -> u8 {
        match self {
            TransactionState::Idle => b'I',
            TransactionState::Transaction => b'T',
            TransactionState::Error => b'E',
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionState::Idle),
            b'T' => Some(TransactionState::Transaction),
            b'E' => Some(TransactionState::Error),
            _ => None,
        }
    }
}

/// Fields of an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorFields {
    pub fn new(severity: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: severity.into(),
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }
}

impl From<&ProxyError> for ErrorFields {
    fn from(err: &ProxyError) -> Self {
        Self {
            severity: err.severity().to_string(),
            code: err.sqlstate().to_string(),
            message: err.to_string(),
            detail: err.detail().map(|d| d.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    /// Any other authentication request (SASL, GSS, ...).
    AuthenticationOther { code: i32 },
    ParameterStatus { key: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { state: TransactionState },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    ParameterDescription { oids: Vec<i32> },
    RowDescription { fields: Vec<Column> },
    DataRow { values: Vec<Option<Vec<u8>>> },
    CommandComplete { tag: String },
    ErrorResponse { fields: ErrorFields },
    NoticeResponse { fields: ErrorFields },
    CopyInResponse { format: i8, columns: Vec<i16> },
    CopyOutResponse { format: i8, columns: Vec<i16> },
    CopyData { data: Vec<u8> },
    CopyDone,
    NotificationResponse { pid: i32, channel: String, payload: String },
}

impl BackendMessage {
    pub fn error(err: &ProxyError) -> Self {
        BackendMessage::ErrorResponse {
            fields: ErrorFields::from(err),
        }
    }

    pub fn ready(state: TransactionState) -> Self {
        BackendMessage::ReadyForQuery { state }
    }

    pub fn code(&self) -> u8 {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMd5Password { .. }
            | BackendMessage::AuthenticationOther { .. } => b'R',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::CloseComplete => b'3',
            BackendMessage::NoData => b'n',
            BackendMessage::PortalSuspended => b's',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ParameterDescription { .. } => b't',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::ErrorResponse { .. } => b'E',
            BackendMessage::NoticeResponse { .. } => b'N',
            BackendMessage::CopyInResponse { .. } => b'G',
            BackendMessage::CopyOutResponse { .. } => b'H',
            BackendMessage::CopyData { .. } => b'd',
            BackendMessage::CopyDone => b'c',
            BackendMessage::NotificationResponse { .. } => b'A',
        }
    }
}
