use crate::error::Error;
use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Sse};
use axum::Extension;
use log::*;
use service::AppState;
use sse::error::{Error as SseError, ErrorKind};
use sse::{stream_headers, ConnectionId, EventStreamWriter, Source};
use tokio::sync::mpsc;

const LAST_EVENT_ID: &str = "last-event-id";

/// GET opens an event stream on the named channel or log.
///
/// The receiver is built before any response headers go out, so a failed
/// subscribe or a malformed `Last-Event-ID` still gets a proper status code.
/// After that the writer task owns the connection and feeds the body one
/// frame at a time.
pub(crate) async fn stream(
    State(app_state): State<AppState>,
    Extension(source): Extension<Source>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Error> {
    // Only logs can resume; channels ignore the header entirely.
    let cursor = match source {
        Source::Durable { .. } => last_event_id(&headers)?,
        Source::Ephemeral { .. } => None,
    };
    let receiver = source.make_receiver(&name, cursor).await?;

    let connection_id = ConnectionId::new();
    info!(
        "Establishing SSE connection {connection_id} on {} {name}",
        source.kind()
    );

    let writer = EventStreamWriter::new(
        connection_id,
        app_state.config.keepalive(),
        app_state.config.client_retry(),
    );

    let (transport, mut frames) = mpsc::channel(1);
    tokio::spawn(writer.run(receiver, transport, app_state.shutdown.child_token()));

    let body = stream! {
        while let Some(frame) = frames.recv().await {
            yield frame;
        }
    };

    Ok((stream_headers(), Sse::new(body)))
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<&str>, Error> {
    headers
        .get(LAST_EVENT_ID)
        .map(|value| {
            value.to_str().map_err(|e| {
                Error::from(SseError {
                    source: Some(Box::new(e)),
                    error_kind: ErrorKind::InvalidCursor(
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    ),
                })
            })
        })
        .transpose()
}
