//! Request-to-broker adapters for the ingest path.
use broker::Broker;
use bytes::Bytes;
use log::*;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";
const TEXT_PLAIN: &str = "text/plain";

/// The parts of an inbound POST the senders look at.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl IngestRequest {
    pub fn new(content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            body: body.into(),
        }
    }

    /// Lower-cased media type without parameters, e.g. `text/plain` for
    /// `Text/Plain; charset=utf-8`.
    pub fn media_type(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        let media_type = content_type.split(';').next()?.trim();
        if media_type.is_empty() || !media_type.contains('/') {
            return None;
        }
        Some(media_type.to_ascii_lowercase())
    }
}

/// Broker-assigned result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Number of channel subscribers that received the publication.
    Subscribers(i64),
    /// Id of the newly appended log entry.
    EntryId(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Subscribers(count) => write!(f, "{count}"),
            Outcome::EntryId(id) => f.write_str(id),
        }
    }
}

#[derive(Clone)]
enum Mode {
    Publish,
    Append,
}

/// Sends request payloads to one named channel or log. Holds no state beyond
/// the name and the shared broker handle, so one sender may serve concurrent
/// requests.
#[derive(Clone)]
pub struct Sender {
    source: String,
    broker: Arc<dyn Broker>,
    mode: Mode,
}

impl Sender {
    pub(crate) fn publisher(source: &str, broker: Arc<dyn Broker>) -> Self {
        Self {
            source: source.to_string(),
            broker,
            mode: Mode::Publish,
        }
    }

    pub(crate) fn appender(source: &str, broker: Arc<dyn Broker>) -> Self {
        Self {
            source: source.to_string(),
            broker,
            mode: Mode::Append,
        }
    }

    pub async fn perform(&self, request: IngestRequest) -> Result<Outcome> {
        match self.mode {
            Mode::Publish => {
                let subscribers = self.broker.publish(&self.source, &request.body).await?;
                debug!("Published to {} ({subscribers} subscriber(s))", self.source);
                Ok(Outcome::Subscribers(subscribers))
            }
            Mode::Append => {
                let fields = decode_fields(&request)?;
                let id = self.broker.append(&self.source, &fields).await?;
                debug!("Appended entry {id} to {}", self.source);
                Ok(Outcome::EntryId(id.to_string()))
            }
        }
    }
}

/// Turn a request into the field map of a new log entry.
///
/// A form body with at least one field is stored as-is, the last value
/// winning for repeated keys. Anything else is stored whole under `json` or
/// `text` depending on the media type.
pub fn decode_fields(request: &IngestRequest) -> Result<Vec<(String, Vec<u8>)>> {
    let media_type = request.media_type();

    if media_type.as_deref() == Some(FORM_URLENCODED) {
        let fields = form_fields(&request.body);
        if !fields.is_empty() {
            return Ok(fields);
        }
    }

    match media_type.as_deref() {
        Some(APPLICATION_JSON) => {
            serde_json::from_slice::<serde_json::Value>(&request.body).map_err(|e| {
                Error {
                    error_kind: ErrorKind::InvalidPayload("invalid JSON".to_string()),
                    source: Some(Box::new(e)),
                }
            })?;
            Ok(vec![("json".to_string(), request.body.to_vec())])
        }
        Some(TEXT_PLAIN) => Ok(vec![("text".to_string(), request.body.to_vec())]),
        other => Err(Error::new(ErrorKind::UnsupportedContentType(
            other
                .map(str::to_string)
                .or_else(|| request.content_type.clone())
                .unwrap_or_default(),
        ))),
    }
}

fn form_fields(body: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut fields: Vec<(String, Vec<u8>)> = Vec::new();
    for (key, value) in form_urlencoded::parse(body) {
        let value = value.into_owned().into_bytes();
        match fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => fields.push((key.into_owned(), value)),
        }
    }
    fields
}
