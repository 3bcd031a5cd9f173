use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use sse::error::{Error as SseError, ErrorKind};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error(SseError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

impl Error {
    // List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html
    pub fn status_code(&self) -> StatusCode {
        match self.0.error_kind {
            ErrorKind::InvalidCursor(_) | ErrorKind::InvalidSourceName(_) => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::BrokerUnavailable
            | ErrorKind::InvalidPayload(_)
            | ErrorKind::UnsupportedContentType(_)
            | ErrorKind::TransportWriteFailed
            | ErrorKind::Shutdown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.error_kind
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

impl<E> From<E> for Error
where
    E: Into<SseError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
