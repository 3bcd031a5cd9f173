use anyhow::{Context, Result};
use reqwest::Client;

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// Publishes `text` on a channel and returns the subscriber count.
    pub async fn publish(&self, path: &str, text: &str) -> Result<i64> {
        let body = self
            .post(path, "text/plain", text.to_string())
            .await
            .context("Failed to publish message")?;

        body.trim()
            .parse()
            .with_context(|| format!("Subscriber count expected, got {body:?}"))
    }

    /// Appends a form-encoded entry to a stream and returns its id.
    pub async fn append_form(&self, path: &str, fields: &[(&str, &str)]) -> Result<String> {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        self.post(path, "application/x-www-form-urlencoded", body)
            .await
            .context("Failed to append entry")
    }

    /// Appends a plain-text entry to a stream and returns its id.
    pub async fn append_text(&self, path: &str, text: &str) -> Result<String> {
        self.post(path, "text/plain", text.to_string())
            .await
            .context("Failed to append entry")
    }

    async fn post(&self, path: &str, content_type: &str, body: String) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());

        if !status.is_success() {
            anyhow::bail!("POST {} failed: {} - Response: {}", path, status, text);
        }

        Ok(text)
    }
}
