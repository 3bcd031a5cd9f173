//! Error types for the `sse` layer.
//!
//! Broker errors are translated into [`ErrorKind::BrokerUnavailable`] here so
//! that the `web` layer only needs to know about this crate's error kinds when
//! choosing a status code.
use std::error::Error as StdError;
use std::fmt;

use broker::error::Error as BrokerError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    // Connect/subscribe/publish/read failure against the broker
    BrokerUnavailable,
    // Body does not match its declared content type
    InvalidPayload(String),
    // Content type not accepted by the log ingest path
    UnsupportedContentType(String),
    // The client connection no longer accepts frames
    TransportWriteFailed,
    // Resume position (`Last-Event-ID`) is not a log entry id
    InvalidCursor(String),
    // Source name cannot be framed as an SSE event name
    InvalidSourceName(String),
    // The background listener did not stop cleanly
    Shutdown(String),
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Error {
            source: None,
            error_kind,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::BrokerUnavailable => match &self.source {
                Some(source) => write!(f, "broker unavailable: {source}"),
                None => write!(f, "broker unavailable"),
            },
            ErrorKind::InvalidPayload(reason) => write!(f, "invalid payload: {reason}"),
            ErrorKind::UnsupportedContentType(content_type) => {
                write!(f, "unknown Content-Type: {content_type}")
            }
            ErrorKind::TransportWriteFailed => write!(f, "client connection closed"),
            ErrorKind::InvalidCursor(cursor) => write!(f, "invalid Last-Event-ID: {cursor:?}"),
            ErrorKind::InvalidSourceName(name) => write!(f, "invalid source name: {name:?}"),
            ErrorKind::Shutdown(reason) => write!(f, "listener shutdown failed: {reason}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::BrokerUnavailable,
        }
    }
}
