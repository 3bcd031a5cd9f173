//! The two kinds of broker-backed sources a client can stream from or post to.
use broker::{Broker, EntryId};
use log::*;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// Upper bound of one blocking log read.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A family of named sources. The variant is chosen once, when the route is
/// built; every receiver and sender made from it uses that variant's
/// transport.
#[derive(Clone)]
pub enum Source {
    /// Publish/subscribe channels; nothing is persisted.
    Ephemeral { broker: Arc<dyn Broker> },
    /// Append-only logs, resumable from any entry id.
    Durable {
        broker: Arc<dyn Broker>,
        poll_timeout: Duration,
    },
}

impl Source {
    pub fn ephemeral(broker: Arc<dyn Broker>) -> Self {
        Source::Ephemeral { broker }
    }

    pub fn durable(broker: Arc<dyn Broker>) -> Self {
        Source::Durable {
            broker,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Source::Ephemeral { .. } => "pubsub",
            Source::Durable { .. } => "stream",
        }
    }

    /// Start listening on `name`.
    ///
    /// Channel sources subscribe before returning, so anything published
    /// after this call is delivered. Log sources resume strictly after
    /// `cursor` (the client's `Last-Event-ID`); no cursor, or an empty one,
    /// starts from the beginning of the log. Channel sources ignore `cursor`.
    pub async fn make_receiver(&self, name: &str, cursor: Option<&str>) -> Result<Receiver> {
        validate_name(name)?;

        match self {
            Source::Ephemeral { broker } => {
                let subscription = broker.subscribe(name).await.map_err(|e| {
                    warn!("Subscribe to {name} failed: {e}");
                    Error::from(e)
                })?;
                Ok(Receiver::spawn_ephemeral(name, subscription))
            }
            Source::Durable {
                broker,
                poll_timeout,
            } => {
                let cursor = parse_cursor(cursor)?;
                Ok(Receiver::spawn_durable(
                    Arc::clone(broker),
                    name,
                    cursor,
                    *poll_timeout,
                ))
            }
        }
    }

    pub fn make_sender(&self, name: &str) -> Result<Sender> {
        validate_name(name)?;

        Ok(match self {
            Source::Ephemeral { broker } => Sender::publisher(name, Arc::clone(broker)),
            Source::Durable { broker, .. } => Sender::appender(name, Arc::clone(broker)),
        })
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<EntryId> {
    match cursor.map(str::trim) {
        None | Some("") => Ok(EntryId::ZERO),
        Some(cursor) => cursor.parse::<EntryId>().map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::InvalidCursor(cursor.to_string()),
        }),
    }
}

/// Source names are a single path segment and end up on `event:` lines, so
/// they may not contain `/` or line breaks.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\r', '\n']) {
        return Err(Error::new(ErrorKind::InvalidSourceName(name.to_string())));
    }
    Ok(())
}
