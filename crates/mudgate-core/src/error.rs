use thiserror::Error;

/// Errors produced by the proxy core and server.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream closed")]
    UpstreamClosed,

    #[error("malformed control message: {0}")]
    MalformedControl(String),

    #[error("invalid upstream address: {0}")]
    Address(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::MalformedControl(e.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
