use crate::error::Error;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use log::*;
use serde_json::json;
use sse::{IngestRequest, Outcome, Source};

/// POST publishes the body to the named channel, or appends it to the named
/// log. Replies with the subscriber count or the new entry id, as plain text
/// unless the client asks for JSON.
pub(crate) async fn ingest(
    Extension(source): Extension<Source>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let wants_json = accepts_json(&headers);
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let request = IngestRequest::new(content_type, body);

    let operation = match source {
        Source::Ephemeral { .. } => "publish",
        Source::Durable { .. } => "append",
    };

    let submitted = match source.make_sender(&name) {
        Ok(sender) => sender.perform(request).await,
        Err(e) => Err(e),
    };

    match submitted {
        Ok(outcome) => {
            debug!("Submitted message to {} {name}: {outcome}", source.kind());
            success(outcome, wants_json)
        }
        Err(e) => {
            error!("Error submitting message ({operation}) to {} {name}: {e}", source.kind());
            failure(Error::from(e), wants_json)
        }
    }
}

fn success(outcome: Outcome, wants_json: bool) -> Response {
    let no_cache = [(CACHE_CONTROL, "no-cache")];
    if !wants_json {
        return (StatusCode::OK, no_cache, outcome.to_string()).into_response();
    }

    let body = match outcome {
        Outcome::Subscribers(count) => json!({ "success": true, "subscribers": count }),
        Outcome::EntryId(id) => json!({ "success": true, "id": id }),
    };
    (StatusCode::OK, no_cache, Json(body)).into_response()
}

fn failure(error: Error, wants_json: bool) -> Response {
    let no_cache = [(CACHE_CONTROL, "no-cache")];
    let status = error.status_code();
    if wants_json {
        let body = json!({ "success": false, "error": error.to_string() });
        return (status, no_cache, Json(body)).into_response();
    }
    (
        status,
        no_cache,
        format!("Error submitting message: {error}"),
    )
        .into_response()
}

/// True when `Accept` lists `application/json` ahead of, or instead of,
/// plain text. Quality values are not weighed.
fn accepts_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    for range in accept.split(',') {
        let media = range.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match media.as_str() {
            "application/json" => return true,
            "text/plain" | "text/*" => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_accept(accept: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_str(accept).unwrap());
        headers
    }

    #[test]
    fn json_is_negotiated_from_accept() {
        assert!(accepts_json(&with_accept("application/json")));
        assert!(accepts_json(&with_accept("application/json; charset=utf-8, */*")));
        assert!(!accepts_json(&with_accept("text/plain, application/json")));
        assert!(!accepts_json(&with_accept("*/*")));
        assert!(!accepts_json(&HeaderMap::new()));
    }
}
