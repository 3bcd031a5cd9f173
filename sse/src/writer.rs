//! Per-connection SSE state machine.
//!
//! ```text
//! Opening ──(padding, retry written)──▶ Streaming ──▶ Closed
//!    │                                     │  ▲
//!    └──────────(write failed)─────────────┼──┘ (message / keep-alive written)
//!                                          ▼
//!                       end of stream, disconnect, cancel, write failed
//! ```
//!
//! Frames are handed to the response body one event at a time through a
//! single-slot channel (the [`Transport`]). The HTTP server writes and flushes
//! each frame as soon as the body yields it, and a client that stops reading
//! stalls the writer, which in turn stalls the receiver's listener.
use axum::http::header::{HeaderName, HeaderValue, CONNECTION};
use axum::response::sse::Event;
use log::*;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionId;
use crate::error::{Error, ErrorKind};
use crate::message::{Delivery, Message};
use crate::receiver::Receiver;

/// Response body side of a streaming connection.
pub type Transport = mpsc::Sender<Result<Event, Infallible>>;

/// Filler characters in the opening comment. Enough to push buffering
/// proxies into forwarding the stream right away.
const PADDING_LEN: usize = 2048;

/// Headers a stream response carries on top of the `text/event-stream`
/// content type and `no-cache` set by `axum::response::sse::Sse`.
pub fn stream_headers() -> [(HeaderName, HeaderValue); 2] {
    [
        (CONNECTION, HeaderValue::from_static("keep-alive")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The receiver's listener exited.
    EndOfStream,
    /// The client went away.
    ClientDisconnected,
    /// The server is shutting down.
    Cancelled,
    /// A frame could not be handed to the transport.
    WriteFailed,
}

enum State {
    Opening,
    Streaming,
    Closed(CloseReason),
}

pub struct EventStreamWriter {
    connection_id: ConnectionId,
    keepalive: Option<Duration>,
    client_retry: Option<Duration>,
}

impl EventStreamWriter {
    /// Zero durations disable the keep-alive timer and the `retry:` frame.
    pub fn new(
        connection_id: ConnectionId,
        keepalive: Option<Duration>,
        client_retry: Option<Duration>,
    ) -> Self {
        Self {
            connection_id,
            keepalive: keepalive.filter(|d| !d.is_zero()),
            client_retry: client_retry.filter(|d| d.as_millis() > 0),
        }
    }

    /// Drive one connection until it closes. The receiver is shut down
    /// exactly once on the way out, whatever the reason.
    pub async fn run(
        self,
        mut receiver: Receiver,
        transport: Transport,
        cancel: CancellationToken,
    ) -> CloseReason {
        debug!(
            "Opening event stream {} for {}",
            self.connection_id,
            receiver.source()
        );

        let mut state = State::Opening;
        let reason = loop {
            state = match state {
                State::Opening => self.open(&transport, &cancel).await,
                State::Streaming => self.stream_next(&mut receiver, &transport, &cancel).await,
                State::Closed(reason) => break reason,
            };
        };

        self.close(receiver, reason).await;
        reason
    }

    async fn open(&self, transport: &Transport, cancel: &CancellationToken) -> State {
        if let Err(reason) = self.write(transport, cancel, padding_frame(), "Padding").await {
            return State::Closed(reason);
        }

        if let Some(retry) = self.client_retry {
            if let Err(reason) = self.write(transport, cancel, retry_frame(retry), "Retry-time").await {
                return State::Closed(reason);
            }
        }

        State::Streaming
    }

    async fn stream_next(
        &self,
        receiver: &mut Receiver,
        transport: &Transport,
        cancel: &CancellationToken,
    ) -> State {
        // The keep-alive timer restarts on every pass through here.
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return State::Closed(CloseReason::Cancelled),
            _ = transport.closed() => return State::Closed(CloseReason::ClientDisconnected),
            delivery = receiver.next(self.keepalive) => delivery,
        };

        let written = match delivery {
            Delivery::Data(message) => {
                self.write(transport, cancel, message_frame(&message), "Message")
                    .await
            }
            Delivery::Timeout => {
                self.write(transport, cancel, keepalive_frame(), "Keepalive")
                    .await
            }
            Delivery::EndOfStream => return State::Closed(CloseReason::EndOfStream),
        };

        match written {
            Ok(()) => State::Streaming,
            Err(reason) => State::Closed(reason),
        }
    }

    async fn write(
        &self,
        transport: &Transport,
        cancel: &CancellationToken,
        frame: Event,
        what: &str,
    ) -> Result<(), CloseReason> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CloseReason::Cancelled),
            sent = send_frame(transport, frame) => sent.map_err(|e| {
                debug!("{what} Transmit Failed on {}: {e}", self.connection_id);
                CloseReason::WriteFailed
            }),
        }
    }

    async fn close(&self, receiver: Receiver, reason: CloseReason) {
        let source = receiver.source().to_string();
        debug!(
            "Closing event stream {} for {source}: {reason:?}",
            self.connection_id
        );

        if let Err(e) = receiver.shutdown().await {
            warn!(
                "Receiver shutdown error on {} for {source}: {e}",
                self.connection_id
            );
        }
    }
}

/// Hand one frame to the response body.
async fn send_frame(transport: &Transport, frame: Event) -> Result<(), Error> {
    transport
        .send(Ok(frame))
        .await
        .map_err(|_| Error::new(ErrorKind::TransportWriteFailed))
}

fn padding_frame() -> Event {
    Event::default().comment(format!("--->{}<--- padding", " ".repeat(PADDING_LEN)))
}

// Written as `retry:<ms>`; SSE parsers drop the optional space after the colon.
fn retry_frame(retry: Duration) -> Event {
    Event::default().retry(retry)
}

fn keepalive_frame() -> Event {
    Event::default().comment("keep-alive")
}

fn message_frame(message: &Message) -> Event {
    let mut frame = Event::default();
    if let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) {
        frame = frame.id(id);
    }
    frame
        .event(&message.source)
        .data(message.data_lines().collect::<Vec<_>>().join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use axum::response::{IntoResponse, Sse};
    use broker::{Broker, EntryId, MemoryBroker};
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    /// What the client would read: one string per frame.
    fn wire(mut rx: mpsc::Receiver<Result<Event, Infallible>>) -> BoxStream<'static, String> {
        let events = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };

        Sse::new(events)
            .into_response()
            .into_body()
            .into_data_stream()
            .map(|chunk| String::from_utf8(chunk.expect("body chunk").to_vec()).expect("utf-8"))
            .boxed()
    }

    async fn render(frame: Event) -> String {
        let (tx, rx) = mpsc::channel(1);
        tx.send(Ok(frame)).await.unwrap();
        drop(tx);
        wire(rx).collect::<Vec<_>>().await.concat()
    }

    fn start(
        writer: EventStreamWriter,
        receiver: Receiver,
        cancel: CancellationToken,
    ) -> (JoinHandle<CloseReason>, BoxStream<'static, String>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(writer.run(receiver, tx, cancel));
        (handle, wire(rx))
    }

    fn writer(keepalive_secs: u64, retry_ms: u64) -> EventStreamWriter {
        EventStreamWriter::new(
            ConnectionId::new(),
            Some(Duration::from_secs(keepalive_secs)),
            Some(Duration::from_millis(retry_ms)),
        )
    }

    #[tokio::test]
    async fn padding_frame_is_a_long_comment() {
        let frame = render(padding_frame()).await;
        assert!(frame.starts_with(": --->"));
        assert!(frame.contains(&" ".repeat(PADDING_LEN)));
        assert!(frame.ends_with("<--- padding\n\n"));
    }

    #[tokio::test]
    async fn retry_frame_is_in_milliseconds() {
        assert_eq!(
            render(retry_frame(Duration::from_millis(1500))).await,
            "retry:1500\n\n"
        );
    }

    #[tokio::test]
    async fn sending_to_a_closed_transport_is_a_write_failure() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = send_frame(&tx, keepalive_frame()).await.err().unwrap();
        assert_eq!(err.error_kind, ErrorKind::TransportWriteFailed);
    }

    #[tokio::test]
    async fn keepalive_frame_is_a_comment_line() {
        assert_eq!(render(keepalive_frame()).await, ": keep-alive\n\n");
    }

    #[tokio::test]
    async fn message_frame_writes_one_data_line_per_text_line() {
        let frame = render(message_frame(&Message::publication("news", "one\ntwo"))).await;
        assert_eq!(frame, "event: news\ndata: one\ndata: two\n\n");
    }

    #[tokio::test]
    async fn message_frame_includes_id_only_when_present() {
        let with_id = render(message_frame(&Message::entry("5-1", "orders", "a=1"))).await;
        assert_eq!(with_id, "id: 5-1\nevent: orders\ndata: a=1\n\n");

        let empty_id = render(message_frame(&Message::entry("", "orders", "a=1"))).await;
        assert_eq!(empty_id, "event: orders\ndata: a=1\n\n");
    }

    #[tokio::test]
    async fn streams_publications_until_the_channel_closes() {
        let broker = MemoryBroker::new();
        let source = Source::ephemeral(Arc::new(broker.clone()));
        let receiver = source.make_receiver("news", None).await.unwrap();

        let (handle, mut frames) = start(writer(0, 1500), receiver, CancellationToken::new());

        assert!(frames.next().await.unwrap().starts_with(": --->"));
        assert_eq!(frames.next().await.unwrap(), "retry:1500\n\n");

        broker.publish("news", b"hello\nworld").await.unwrap();
        assert_eq!(
            frames.next().await.unwrap(),
            "event: news\ndata: hello\ndata: world\n\n"
        );

        broker.close_channel("news");
        assert_eq!(frames.next().await, None);
        assert_eq!(handle.await.unwrap(), CloseReason::EndOfStream);
    }

    #[tokio::test]
    async fn resumes_a_log_after_the_last_event_id() {
        let broker = MemoryBroker::new();
        for ms in 1..=3 {
            broker
                .insert("orders", EntryId::new(ms, 0), &[("n", ms.to_string().as_str())])
                .unwrap();
        }
        let source = Source::durable(Arc::new(broker.clone()));
        let receiver = source.make_receiver("orders", Some("1")).await.unwrap();

        let (_handle, mut frames) = start(writer(0, 0), receiver, CancellationToken::new());

        assert!(frames.next().await.unwrap().starts_with(": --->"));
        assert_eq!(
            frames.next().await.unwrap(),
            "id: 2-0\nevent: orders\ndata: n=2\n\n"
        );
        assert_eq!(
            frames.next().await.unwrap(),
            "id: 3-0\nevent: orders\ndata: n=3\n\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_gets_keepalives_within_the_interval() {
        let broker = MemoryBroker::new();
        let source = Source::ephemeral(Arc::new(broker.clone()));
        let receiver = source.make_receiver("quiet", None).await.unwrap();

        let (_handle, mut frames) = start(writer(5, 0), receiver, CancellationToken::new());
        assert!(frames.next().await.unwrap().starts_with(": --->"));

        for _ in 0..3 {
            let started = tokio::time::Instant::now();
            assert_eq!(frames.next().await.unwrap(), ": keep-alive\n\n");
            assert!(started.elapsed() <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_keepalive_disables_the_timer() {
        let broker = MemoryBroker::new();
        let source = Source::ephemeral(Arc::new(broker.clone()));
        let receiver = source.make_receiver("quiet", None).await.unwrap();

        let (_handle, mut frames) = start(writer(0, 0), receiver, CancellationToken::new());
        assert!(frames.next().await.unwrap().starts_with(": --->"));

        let next = tokio::time::timeout(Duration::from_secs(3600), frames.next()).await;
        assert!(next.is_err(), "no frame expected on an idle stream");
    }

    #[tokio::test]
    async fn client_disconnect_closes_and_releases_the_subscription() {
        let broker = MemoryBroker::new();
        let source = Source::ephemeral(Arc::new(broker.clone()));
        let receiver = source.make_receiver("news", None).await.unwrap();

        let (handle, mut frames) = start(writer(0, 0), receiver, CancellationToken::new());
        assert!(frames.next().await.unwrap().starts_with(": --->"));

        drop(frames);

        assert_eq!(handle.await.unwrap(), CloseReason::ClientDisconnected);
        assert_eq!(broker.publish("news", b"late").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_without_further_frames() {
        let broker = MemoryBroker::new();
        let source = Source::ephemeral(Arc::new(broker.clone()));
        let receiver = source.make_receiver("news", None).await.unwrap();
        let cancel = CancellationToken::new();

        let (handle, mut frames) = start(writer(0, 0), receiver, cancel.clone());
        assert!(frames.next().await.unwrap().starts_with(": --->"));

        cancel.cancel();

        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);
        assert_eq!(frames.next().await, None);
        assert_eq!(broker.publish("news", b"late").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_opening_write_still_shuts_the_receiver_down() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let source = Source::ephemeral(Arc::clone(&broker));
        let receiver = source.make_receiver("news", None).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let reason = writer(0, 0)
            .run(receiver, tx, CancellationToken::new())
            .await;

        assert_eq!(reason, CloseReason::WriteFailed);
        assert_eq!(broker.publish("news", b"x").await.unwrap(), 0);
    }

    #[test]
    fn zero_durations_are_disabled() {
        let writer = EventStreamWriter::new(
            ConnectionId::new(),
            Some(Duration::ZERO),
            Some(Duration::from_micros(10)),
        );
        assert_eq!(writer.keepalive, None);
        assert_eq!(writer.client_retry, None);
    }
}
