//! In-process broker backend.
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{BrokerErrorKind, Error, Result};
use crate::{Broker, EntryId, LogEntry, Publication, Subscription};

const CHANNEL_CAPACITY: usize = 64;

/// Broker that keeps channels and logs in process memory.
///
/// Channels are `tokio::sync::broadcast` channels; logs are vectors of
/// entries guarded per log by a `DashMap` shard. Cloning is cheap and every
/// clone shares the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    channels: DashMap<String, broadcast::Sender<Publication>>,
    logs: DashMap<String, Vec<LogEntry>>,
    appended: Notify,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close `channel`, ending every live subscription to it.
    pub fn close_channel(&self, channel: &str) {
        if self.inner.channels.remove(channel).is_some() {
            debug!("Closed in-memory channel {channel}");
        }
    }

    /// Simulate a broker outage: while set, every operation fails with a
    /// connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
    }

    /// Append an entry with a caller-chosen id. The id must be greater than
    /// the last id in the log.
    pub fn insert(&self, log: &str, id: EntryId, fields: &[(&str, &str)]) -> Result<()> {
        let mut entries = self.inner.logs.entry(log.to_string()).or_default();
        if let Some(last) = entries.last() {
            if id <= last.id {
                return Err(Error::new(BrokerErrorKind::Decode(format!(
                    "entry id {id} is not greater than last id {}",
                    last.id
                ))));
            }
        }
        entries.push(LogEntry {
            id,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        drop(entries);

        self.inner.appended.notify_waiters();
        Ok(())
    }

    /// Snapshot of every entry currently in `log`.
    pub fn entries(&self, log: &str) -> Vec<LogEntry> {
        self.inner
            .logs
            .get(log)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(Error::new(BrokerErrorKind::Connection))
        } else {
            Ok(())
        }
    }

    fn entries_after(&self, log: &str, after: &EntryId) -> Vec<LogEntry> {
        self.inner
            .logs
            .get(log)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.id > *after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_id(last: Option<EntryId>) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        match last {
            Some(last) if now_ms <= last.ms => last.successor(),
            _ => EntryId::new(now_ms, 0),
        }
    }
}

/// One subscriber's end of a channel. The channel is forgotten once its last
/// subscriber goes away.
struct ChannelSubscriber {
    channel: String,
    receiver: Option<broadcast::Receiver<Publication>>,
    inner: Arc<Inner>,
}

impl ChannelSubscriber {
    async fn recv(&mut self) -> std::result::Result<Publication, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for ChannelSubscriber {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.inner
            .channels
            .remove_if(&self.channel, |_, sender| sender.receiver_count() == 0);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.check_available()?;

        let receiver = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let subscriber = ChannelSubscriber {
            channel: channel.to_string(),
            receiver: Some(receiver),
            inner: Arc::clone(&self.inner),
        };

        let publications = futures::stream::unfold(subscriber, |mut subscriber| async move {
            loop {
                match subscriber.recv().await {
                    Ok(publication) => return Some((publication, subscriber)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("In-memory subscriber lagged, {skipped} publication(s) dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(publications.boxed())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64> {
        self.check_available()?;

        let publication = Publication {
            channel: channel.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };

        let subscribers = match self.inner.channels.get(channel) {
            Some(sender) => sender.send(publication).unwrap_or(0),
            None => 0,
        };

        Ok(subscribers as i64)
    }

    async fn append(&self, log: &str, fields: &[(String, Vec<u8>)]) -> Result<EntryId> {
        self.check_available()?;

        let mut entries = self.inner.logs.entry(log.to_string()).or_default();
        let id = Self::next_id(entries.last().map(|entry| entry.id));
        entries.push(LogEntry {
            id,
            fields: fields
                .iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect(),
        });
        drop(entries);

        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn read_after(
        &self,
        log: &str,
        after: &EntryId,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            self.check_available()?;

            let entries = self.entries_after(log, after);
            if !entries.is_empty() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
