//! Background listeners feeding a connection's inbound queue.
//!
//! A [`Receiver`] owns one spawned listener task and the consuming end of a
//! single-slot queue. The listener is the only producer: it pushes one
//! [`Message`] at a time and waits while the slot is full, so a slow client
//! slows down how fast the broker is drained. The listener closes the queue
//! exactly once, when it exits.
use broker::{Broker, EntryId, LogEntry, Subscription};
use futures::StreamExt;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Delivery, Message};

/// How long `shutdown` waits for the listener task to release its broker
/// resources.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Receiver {
    source: String,
    cursor: Option<watch::Receiver<EntryId>>,
    inbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    listener: JoinHandle<()>,
    // Stops the listener if the receiver is dropped without `shutdown`.
    _release_on_drop: DropGuard,
}

impl Receiver {
    /// Start pumping publications from an already active channel
    /// subscription.
    pub(crate) fn spawn_ephemeral(source: &str, subscription: Subscription) -> Self {
        let (inbound_tx, inbound) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let listener = tokio::spawn(pump_publications(
            source.to_string(),
            subscription,
            inbound_tx,
            shutdown.clone(),
        ));

        Self {
            source: source.to_string(),
            cursor: None,
            inbound,
            _release_on_drop: shutdown.clone().drop_guard(),
            shutdown,
            listener,
        }
    }

    /// Start polling `source` for entries after `cursor`.
    pub(crate) fn spawn_durable(
        broker: Arc<dyn Broker>,
        source: &str,
        cursor: EntryId,
        poll_timeout: Duration,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::channel(1);
        let (cursor_tx, cursor_rx) = watch::channel(cursor);
        let shutdown = CancellationToken::new();

        let listener = tokio::spawn(poll_log(
            broker,
            source.to_string(),
            Cursor::new(cursor_tx),
            poll_timeout,
            inbound_tx,
            shutdown.clone(),
        ));

        Self {
            source: source.to_string(),
            cursor: Some(cursor_rx),
            inbound,
            _release_on_drop: shutdown.clone().drop_guard(),
            shutdown,
            listener,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Last log entry id handed to the inbound queue, or the resume position
    /// if nothing has been delivered yet. `None` for channel sources.
    pub fn cursor(&self) -> Option<EntryId> {
        self.cursor.as_ref().map(|cursor| *cursor.borrow())
    }

    /// Wait for the next message, giving up after `wait` when one is given.
    pub async fn next(&mut self, wait: Option<Duration>) -> Delivery {
        let received = match wait {
            Some(wait) => match tokio::time::timeout(wait, self.inbound.recv()).await {
                Ok(received) => received,
                Err(_) => return Delivery::Timeout,
            },
            None => self.inbound.recv().await,
        };

        match received {
            Some(message) => Delivery::Data(message),
            None => Delivery::EndOfStream,
        }
    }

    /// Stop the listener and wait (briefly) for it to release its broker
    /// subscription or pooled connection.
    pub async fn shutdown(self) -> Result<()> {
        let Receiver {
            source,
            inbound,
            shutdown,
            listener,
            ..
        } = self;

        shutdown.cancel();
        drop(inbound);

        match tokio::time::timeout(SHUTDOWN_GRACE, listener).await {
            Ok(Ok(())) => {
                debug!("Listener for {source} stopped");
                Ok(())
            }
            Ok(Err(join_error)) => Err(Error {
                source: Some(Box::new(join_error)),
                error_kind: ErrorKind::Shutdown(format!("listener for {source} failed")),
            }),
            Err(_) => Err(Error::new(ErrorKind::Shutdown(format!(
                "listener for {source} still running after {SHUTDOWN_GRACE:?}"
            )))),
        }
    }
}

/// Last consumed log position. Only ever moves forward.
struct Cursor {
    position: EntryId,
    published: watch::Sender<EntryId>,
}

impl Cursor {
    fn new(published: watch::Sender<EntryId>) -> Self {
        let position = *published.borrow();
        Self {
            position,
            published,
        }
    }

    fn position(&self) -> EntryId {
        self.position
    }

    fn is_consumed(&self, id: &EntryId) -> bool {
        *id <= self.position
    }

    fn advance(&mut self, id: EntryId) {
        if id > self.position {
            self.position = id;
            self.published.send_replace(id);
        }
    }
}

async fn pump_publications(
    source: String,
    mut subscription: Subscription,
    inbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let publication = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = subscription.next() => match next {
                Some(publication) => publication,
                None => {
                    debug!("Subscription to {source} closed by the broker");
                    break;
                }
            },
        };

        // Empty payloads are dropped; they carry nothing to frame.
        if publication.payload.is_empty() {
            continue;
        }

        let message = Message::publication(publication.channel, publication.payload);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = inbound.send(message) => if sent.is_err() { break },
        }
    }

    // Dropping the subscription releases it on the broker side.
    drop(subscription);
}

async fn poll_log(
    broker: Arc<dyn Broker>,
    source: String,
    mut cursor: Cursor,
    poll_timeout: Duration,
    inbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    'poll: loop {
        let after = cursor.position();
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = broker.read_after(&source, &after, poll_timeout) => match read {
                Ok(batch) => batch,
                Err(e) => {
                    // No retry: the stream ends and the client reconnects.
                    error!("Stream Receive Failed for {source}: {e}");
                    break;
                }
            },
        };

        for entry in batch {
            if cursor.is_consumed(&entry.id) {
                continue;
            }

            let id = entry.id;
            let message = Message::entry(id.to_string(), source.as_str(), flatten(&entry));
            tokio::select! {
                _ = shutdown.cancelled() => break 'poll,
                sent = inbound.send(message) => if sent.is_err() { break 'poll },
            }

            cursor.advance(id);
        }
    }
}

/// Render an entry's field map as `key=value` lines.
fn flatten(entry: &LogEntry) -> String {
    entry
        .fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker::{BrokerErrorKind, MemoryBroker};
    use std::sync::Mutex;

    const POLL: Duration = Duration::from_millis(100);
    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    async fn ephemeral(broker: &MemoryBroker, channel: &str) -> Receiver {
        let subscription = broker.subscribe(channel).await.unwrap();
        Receiver::spawn_ephemeral(channel, subscription)
    }

    fn durable(broker: &MemoryBroker, log: &str, cursor: EntryId) -> Receiver {
        Receiver::spawn_durable(Arc::new(broker.clone()), log, cursor, POLL)
    }

    #[tokio::test]
    async fn ephemeral_receiver_delivers_publications_without_id() {
        let broker = MemoryBroker::new();
        let mut receiver = ephemeral(&broker, "news").await;

        broker.publish("news", b"hello").await.unwrap();

        assert_eq!(
            receiver.next(WAIT).await,
            Delivery::Data(Message::publication("news", "hello"))
        );
        assert_eq!(receiver.cursor(), None);
    }

    #[tokio::test]
    async fn ephemeral_receiver_skips_empty_payloads() {
        let broker = MemoryBroker::new();
        let mut receiver = ephemeral(&broker, "news").await;

        broker.publish("news", b"").await.unwrap();
        broker.publish("news", b"after").await.unwrap();

        assert_eq!(
            receiver.next(WAIT).await,
            Delivery::Data(Message::publication("news", "after"))
        );
    }

    #[tokio::test]
    async fn ephemeral_receiver_ends_when_subscription_closes() {
        let broker = MemoryBroker::new();
        let mut receiver = ephemeral(&broker, "news").await;

        broker.close_channel("news");

        assert_eq!(receiver.next(WAIT).await, Delivery::EndOfStream);
        assert!(receiver.shutdown().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn next_times_out_when_nothing_arrives() {
        let broker = MemoryBroker::new();
        let mut receiver = ephemeral(&broker, "quiet").await;

        assert_eq!(
            receiver.next(Some(Duration::from_secs(1))).await,
            Delivery::Timeout
        );
    }

    #[tokio::test]
    async fn durable_receiver_resumes_after_cursor_in_order() {
        let broker = MemoryBroker::new();
        for ms in 1..=3 {
            broker
                .insert("orders", EntryId::new(ms, 0), &[("n", ms.to_string().as_str())])
                .unwrap();
        }

        let mut receiver = durable(&broker, "orders", EntryId::new(1, 0));

        assert_eq!(
            receiver.next(WAIT).await,
            Delivery::Data(Message::entry("2-0", "orders", "n=2"))
        );
        assert_eq!(
            receiver.next(WAIT).await,
            Delivery::Data(Message::entry("3-0", "orders", "n=3"))
        );
        assert_eq!(
            receiver.next(Some(Duration::from_millis(300))).await,
            Delivery::Timeout
        );
    }

    /// Log backend that answers the first few reads with the same batch,
    /// whatever position is asked for, and records every position it saw.
    struct ReplayingLog {
        batch: Vec<LogEntry>,
        replays: usize,
        reads: Mutex<Vec<EntryId>>,
    }

    impl ReplayingLog {
        fn new(ids: &[u64], replays: usize) -> Self {
            let batch = ids
                .iter()
                .map(|ms| LogEntry {
                    id: EntryId::new(*ms, 0),
                    fields: vec![("n".to_string(), ms.to_string())],
                })
                .collect();
            Self {
                batch,
                replays,
                reads: Mutex::new(Vec::new()),
            }
        }

        fn reads(&self) -> Vec<EntryId> {
            self.reads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for ReplayingLog {
        async fn subscribe(&self, _channel: &str) -> broker::Result<Subscription> {
            Err(broker::Error::new(BrokerErrorKind::Command))
        }

        async fn publish(&self, _channel: &str, _payload: &[u8]) -> broker::Result<i64> {
            Ok(0)
        }

        async fn append(
            &self,
            _log: &str,
            _fields: &[(String, Vec<u8>)],
        ) -> broker::Result<EntryId> {
            Err(broker::Error::new(BrokerErrorKind::Command))
        }

        async fn read_after(
            &self,
            _log: &str,
            after: &EntryId,
            block: Duration,
        ) -> broker::Result<Vec<LogEntry>> {
            let read = {
                let mut reads = self.reads.lock().unwrap();
                reads.push(*after);
                reads.len()
            };

            if read <= self.replays {
                Ok(self.batch.clone())
            } else {
                tokio::time::sleep(block).await;
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn replayed_batches_are_delivered_once_and_never_rewind_the_cursor() {
        let log = Arc::new(ReplayingLog::new(&[1, 2, 3], 3));
        let mut receiver = Receiver::spawn_durable(log.clone(), "orders", EntryId::new(1, 0), POLL);

        let mut delivered = Vec::new();
        let mut positions = vec![receiver.cursor().unwrap()];
        loop {
            match receiver.next(Some(Duration::from_millis(500))).await {
                Delivery::Data(message) => {
                    delivered.push(message.id.unwrap());
                    positions.push(receiver.cursor().unwrap());
                }
                Delivery::Timeout => break,
                Delivery::EndOfStream => panic!("listener stopped unexpectedly"),
            }
        }

        assert_eq!(delivered, vec!["2-0".to_string(), "3-0".to_string()]);
        assert!(positions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(receiver.cursor(), Some(EntryId::new(3, 0)));

        let reads = log.reads();
        assert!(reads.len() > 3, "the batch should have been replayed");
        assert!(reads.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(reads.last(), Some(&EntryId::new(3, 0)));
    }

    #[tokio::test]
    async fn durable_receiver_picks_up_new_appends() {
        let broker = MemoryBroker::new();
        let mut receiver = durable(&broker, "orders", EntryId::ZERO);

        let id = broker
            .append("orders", &[("item".to_string(), b"book".to_vec())])
            .await
            .unwrap();

        assert_eq!(
            receiver.next(WAIT).await,
            Delivery::Data(Message::entry(id.to_string(), "orders", "item=book"))
        );
    }

    #[tokio::test]
    async fn durable_cursor_tracks_delivered_entries() {
        let broker = MemoryBroker::new();
        let mut receiver = durable(&broker, "orders", EntryId::new(4, 0));
        assert_eq!(receiver.cursor(), Some(EntryId::new(4, 0)));

        broker.insert("orders", EntryId::new(5, 0), &[("a", "1")]).unwrap();
        broker.insert("orders", EntryId::new(6, 0), &[("a", "2")]).unwrap();

        for expected in ["5-0", "6-0"] {
            let Delivery::Data(message) = receiver.next(WAIT).await else {
                panic!("expected an entry");
            };
            assert_eq!(message.id.as_deref(), Some(expected));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(receiver.cursor(), Some(EntryId::new(6, 0)));
    }

    #[tokio::test]
    async fn durable_receiver_stops_on_broker_error() {
        let broker = MemoryBroker::new();
        let mut receiver = durable(&broker, "orders", EntryId::ZERO);

        broker.set_unavailable(true);

        assert_eq!(receiver.next(WAIT).await, Delivery::EndOfStream);

        // Recovery does not restart a terminated listener.
        broker.set_unavailable(false);
        broker.insert("orders", EntryId::new(9, 0), &[("a", "1")]).unwrap();
        assert_eq!(receiver.next(WAIT).await, Delivery::EndOfStream);
    }

    #[tokio::test]
    async fn shutdown_releases_the_subscription() {
        let broker = MemoryBroker::new();
        let receiver = ephemeral(&broker, "news").await;
        assert_eq!(broker.publish("news", b"x").await.unwrap(), 1);

        receiver.shutdown().await.unwrap();

        assert_eq!(broker.publish("news", b"y").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropping_a_receiver_stops_its_listener() {
        let broker = MemoryBroker::new();
        let receiver = ephemeral(&broker, "news").await;

        drop(receiver);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.publish("news", b"y").await.unwrap(), 0);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let (tx, rx) = watch::channel(EntryId::new(5, 0));
        let mut cursor = Cursor::new(tx);

        cursor.advance(EntryId::new(7, 0));
        // Re-delivery of an older batch.
        cursor.advance(EntryId::new(6, 0));
        cursor.advance(EntryId::new(7, 0));

        assert_eq!(cursor.position(), EntryId::new(7, 0));
        assert_eq!(*rx.borrow(), EntryId::new(7, 0));
        assert!(cursor.is_consumed(&EntryId::new(6, 0)));
        assert!(!cursor.is_consumed(&EntryId::new(7, 1)));
    }

    #[test]
    fn flatten_joins_fields_as_key_value_lines() {
        let entry = LogEntry {
            id: EntryId::new(1, 0),
            fields: vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x y".to_string()),
            ],
        };
        assert_eq!(flatten(&entry), "a=1\nb=x y");
    }
}
