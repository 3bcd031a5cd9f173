use anyhow::{ensure, Result};
use colored::*;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::api_client::ApiClient;
use crate::output::TestResult;
use crate::sse_client::Connection;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
// Time for a fresh stream to reach the broker before anything is published.
const SUBSCRIBE_SETTLE: Duration = Duration::from_millis(300);

/// Where the server exposes each kind of source.
pub struct Prefixes {
    pub pubsub: String,
    pub stream: String,
}

fn unique_name(kind: &str) -> String {
    format!("sse-test-{kind}-{}", Uuid::new_v4())
}

async fn run<F>(name: &str, scenario: F) -> TestResult
where
    F: std::future::Future<Output = Result<()>>,
{
    println!("\n{} {}", "→ Running".blue(), name.bold());
    let started = Instant::now();
    match scenario.await {
        Ok(()) => TestResult::pass(name, started.elapsed()),
        Err(e) => TestResult::fail(name, format!("{e:#}"), started.elapsed()),
    }
}

/// Two listeners on one channel both receive a multi-line publication.
pub async fn test_pubsub_round_trip(
    base_url: &str,
    prefixes: &Prefixes,
    api_client: &ApiClient,
) -> TestResult {
    run("pubsub round trip", async {
        let channel = unique_name("channel");
        let path = format!("{}/{}", prefixes.pubsub, channel);

        let mut first =
            Connection::establish(base_url, &path, None, "Listener 1".to_string()).await?;
        let mut second =
            Connection::establish(base_url, &path, None, "Listener 2".to_string()).await?;
        tokio::time::sleep(SUBSCRIBE_SETTLE).await;

        let subscribers = api_client.publish(&path, "hello\nworld").await?;
        println!("{} Published to {} subscriber(s)", "✓".green(), subscribers);
        ensure!(subscribers >= 2, "expected at least 2 subscribers, got {subscribers}");

        for connection in [&mut first, &mut second] {
            let event = connection.wait_for_event(&channel, EVENT_TIMEOUT).await?;
            ensure!(
                event.data == "hello\nworld",
                "{} got unexpected data {:?}",
                connection.label,
                event.data
            );
            ensure!(event.id.is_none(), "{} got an id on a channel message", connection.label);
            println!("{} {} received the message", "✓".green(), connection.label);
        }
        Ok(())
    })
    .await
}

/// A form-encoded append arrives with its entry id and last-value-wins fields.
pub async fn test_stream_round_trip(
    base_url: &str,
    prefixes: &Prefixes,
    api_client: &ApiClient,
) -> TestResult {
    run("stream round trip", async {
        let log = unique_name("log");
        let path = format!("{}/{}", prefixes.stream, log);

        let mut listener =
            Connection::establish(base_url, &path, None, "Listener".to_string()).await?;

        let id = api_client
            .append_form(&path, &[("a", "1"), ("a", "2"), ("b", "3")])
            .await?;
        println!("{} Appended entry {}", "✓".green(), id);

        let event = listener.wait_for_event(&log, EVENT_TIMEOUT).await?;
        ensure!(event.id.as_deref() == Some(id.as_str()), "id mismatch: {:?}", event.id);

        let mut lines: Vec<&str> = event.data.lines().collect();
        lines.sort_unstable();
        ensure!(lines == ["a=2", "b=3"], "unexpected fields {:?}", lines);
        Ok(())
    })
    .await
}

/// Reconnecting with `Last-Event-ID` replays only the entries after it.
pub async fn test_stream_resume(
    base_url: &str,
    prefixes: &Prefixes,
    api_client: &ApiClient,
) -> TestResult {
    run("stream resume", async {
        let log = unique_name("log");
        let path = format!("{}/{}", prefixes.stream, log);

        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            ids.push(api_client.append_text(&path, text).await?);
        }
        println!("{} Appended entries {}", "✓".green(), ids.join(", "));

        let mut listener =
            Connection::establish(base_url, &path, Some(&ids[0]), "Resumed".to_string()).await?;

        for (expected_id, text) in ids[1..].iter().zip(["two", "three"]) {
            let event = listener.wait_for_event(&log, EVENT_TIMEOUT).await?;
            ensure!(
                event.id.as_deref() == Some(expected_id.as_str()),
                "expected {expected_id}, got {:?}",
                event.id
            );
            ensure!(event.data == format!("text={text}"), "unexpected data {:?}", event.data);
        }
        println!("{} Resumed after {}", "✓".green(), ids[0]);
        Ok(())
    })
    .await
}
