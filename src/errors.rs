//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `wiretap::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying a session.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// io error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// TCP or upstream-proxy connect failure
  #[error("error dialing {addr}: {source}")]
  Dial {
    /// the address that could not be reached
    addr: String,
    /// the underlying connect error
    source: std::io::Error,
  },
  /// malformed or truncated response from the upstream peer
  #[error("error reading upstream response: {0}")]
  UpstreamRead(String),
  /// client-side MITM handshake or outbound TLS handshake failure
  #[error("tls handshake failed: {0}")]
  Handshake(String),
  /// non-http/https URL with no alternative protocol registered
  #[error("unsupported protocol scheme {0:?}")]
  UnsupportedProtocol(String),
  /// certificate generation or signing failure
  #[error("certificate error: {0}")]
  Certificate(String),
  /// unparsable inbound request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// anything else
  #[error("{0}")]
  Other(String),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<std::num::ParseIntError> for Error {
  fn from(value: std::num::ParseIntError) -> Self {
    new_io_error(ErrorKind::InvalidData, &value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
