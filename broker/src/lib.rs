//! Broker access for the SSE bridge.
//!
//! The bridge talks to two kinds of broker resources:
//!
//! - **Channels**: transient publish/subscribe channels. A message published
//!   while nobody is subscribed is lost.
//! - **Logs**: durable, append-only sequences of field maps. Every entry has a
//!   strictly increasing [`EntryId`] and can be re-read from any position.
//!
//! [`Broker`] is the seam between the bridge and a concrete backend. Two
//! backends are provided:
//!
//! - [`RedisBroker`]: Redis pub/sub and Redis streams behind a fixed-size
//!   connection pool.
//! - [`MemoryBroker`]: an in-process implementation for local development and
//!   tests.
//!
//! A broker handle is built once at startup and shared as `Arc<dyn Broker>`.
//!
//! Everything read back is text: SSE frames are UTF-8, so payloads and field
//! values are decoded lossily and invalid byte sequences come out as U+FFFD.
//! Binary data has to be encoded (base64, hex) by the publisher to survive
//! the trip.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

pub mod entry_id;
pub mod error;
pub mod memory;
pub mod redis_broker;

pub use entry_id::EntryId;
pub use error::{BrokerErrorKind, Error, Result};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

/// A payload delivered on a subscribed channel. `payload` is the published
/// bytes decoded as UTF-8, lossily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub channel: String,
    pub payload: String,
}

/// One entry read back from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    /// Field map of the entry, values decoded as UTF-8 lossily. Ordering
    /// carries no meaning.
    pub fields: Vec<(String, String)>,
}

/// Live channel subscription. The stream ends when the broker closes the
/// subscription; no further publications will ever arrive after that.
/// Dropping the stream releases the subscription.
pub type Subscription = BoxStream<'static, Publication>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to `channel`. The subscription is active when this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Publish `payload` to `channel`, returning the number of subscribers
    /// that received it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64>;

    /// Append a new entry to `log` with a broker-generated id.
    async fn append(&self, log: &str, fields: &[(String, Vec<u8>)]) -> Result<EntryId>;

    /// Read the entries of `log` strictly after `after`, in ascending id
    /// order. Waits up to `block` for new entries; an empty batch means the
    /// wait timed out.
    async fn read_after(&self, log: &str, after: &EntryId, block: Duration)
        -> Result<Vec<LogEntry>>;
}
