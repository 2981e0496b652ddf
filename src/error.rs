use std::fmt;

use crate::connection::Network;
use crate::proxy::protocols::mino::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("unknown protocol")]
    UnknownProtocol,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("remote status: {0}")]
    Status(StatusCode),

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(Network),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn certificate<T: fmt::Display>(msg: T) -> Self {
        Error::Certificate(msg.to_string())
    }

    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        Error::Auth(msg.to_string())
    }

    pub fn handshake<T: fmt::Display>(msg: T) -> Self {
        Error::Handshake(msg.to_string())
    }

    pub fn frame<T: fmt::Display>(msg: T) -> Self {
        Error::Frame(msg.to_string())
    }

    pub fn remote<T: fmt::Display>(msg: T) -> Self {
        Error::Remote(msg.to_string())
    }

    pub fn invalid_config<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidConfig(msg.to_string())
    }

    /// The mino status code that reports this error to a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Status(code) => *code,
            Error::Auth(_) => StatusCode::AuthFailed,
            Error::UnsupportedNetwork(_) => StatusCode::UnsupportedNetwork,
            Error::Frame(_) => StatusCode::MalformedRequest,
            _ => StatusCode::UnknownError,
        }
    }

    /// True when the underlying failure is a refused TCP connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused)
    }
}
