//! Error types for the `broker` layer.
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while talking to the broker. `source` holds the backend
/// error that caused it, `error_kind` the category callers branch on.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: BrokerErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerErrorKind {
    // The broker could not be reached or the connection dropped
    Connection,
    // The broker rejected or failed a command
    Command,
    // No pooled connection could be acquired, or the pool could not be built
    Pool,
    // A broker reply could not be decoded
    Decode(String),
}

impl Error {
    pub fn new(error_kind: BrokerErrorKind) -> Self {
        Error {
            source: None,
            error_kind,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Broker Error ({:?}): {source}", self.error_kind),
            None => write!(f, "Broker Error ({:?})", self.error_kind),
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

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let error_kind = if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            BrokerErrorKind::Connection
        } else {
            BrokerErrorKind::Command
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        // A backend error while creating a pooled connection is a connection failure.
        let error_kind = match &err {
            deadpool_redis::PoolError::Backend(_) => BrokerErrorKind::Connection,
            _ => BrokerErrorKind::Pool,
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<deadpool_redis::BuildError> for Error {
    fn from(err: deadpool_redis::BuildError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: BrokerErrorKind::Pool,
        }
    }
}

impl From<crate::entry_id::ParseEntryIdError> for Error {
    fn from(err: crate::entry_id::ParseEntryIdError) -> Self {
        Error {
            error_kind: BrokerErrorKind::Decode(err.to_string()),
            source: Some(Box::new(err)),
        }
    }
}
