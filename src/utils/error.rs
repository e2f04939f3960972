//! The `error` module defines the error types used within `centralbus`.
//!
//! `BusError` covers everything that can go wrong while binding, connecting,
//! logging or answering control requests. `DecodeError` is the narrower class
//! of malformed input: frames, multipart bodies and log records. Decode
//! errors are always caught where they happen and never stop the broker.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("{0} is not started")]
    NotStarted(&'static str),

    #[error("connection closed")]
    Closed,
}

impl BusError {
    /// Short name of the error class, used when reporting failures over the
    /// control channel.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::Endpoint { .. } => "EndpointError",
            BusError::Bind { .. } => "BindError",
            BusError::Connect { .. } => "ConnectError",
            BusError::WebSocket(_) => "WebSocketError",
            BusError::Io(_) => "IoError",
            BusError::Json(_) => "JsonError",
            BusError::Config(_) => "ConfigError",
            BusError::Decode(_) => "DecodeError",
            BusError::UnknownMethod(_) => "UnknownMethod",
            BusError::Rpc(_) => "RpcError",
            BusError::NotStarted(_) => "NotStarted",
            BusError::Closed => "Closed",
        }
    }
}

impl From<tungstenite::Error> for BusError {
    fn from(err: tungstenite::Error) -> Self {
        BusError::WebSocket(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame has no topic delimiter")]
    MissingDelimiter,

    #[error("topic is not valid utf-8")]
    InvalidTopic,

    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("malformed log record at byte {offset}: {reason}")]
    LogRecord { offset: u64, reason: String },
}
