//! Error types for the proxy core

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while running the proxy core
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate loading, generation or signing error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS configuration or handshake error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP type error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed request on the wire
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Failure on the origin leg: DNS, dial, TLS or response read
  #[error("Upstream error: {0}")]
  Upstream(String),

  /// HAR serialization error
  #[error("Export error: {0}")]
  Export(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::debug!("Upstream error: {}", error);
    error
  }

  /// Create an export error and log it
  pub fn export(msg: impl Into<String>) -> Self {
    let error = Error::Export(msg.into());
    tracing::error!("Export error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::Tls(value.to_string())
  }
}
