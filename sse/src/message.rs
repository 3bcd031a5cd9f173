/// Unit of data moving from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Log entry id; `None` for channel publications.
    pub id: Option<String>,
    /// Channel or log name, sent as the SSE event name.
    pub source: String,
    /// Payload. Each `\n`-separated line becomes one `data:` line.
    pub text: String,
}

impl Message {
    pub fn publication(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            text: text.into(),
        }
    }

    pub fn entry(id: impl Into<String>, source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            source: source.into(),
            text: text.into(),
        }
    }

    /// Lines of `text` as they go out on the wire. CRLF and lone CR count as
    /// line breaks, like an SSE parser on the client would treat them.
    pub fn data_lines(&self) -> impl Iterator<Item = &str> {
        self.text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .flat_map(|line| line.split('\r'))
    }
}

/// Outcome of waiting on a receiver's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Data(Message),
    /// The listener has exited; nothing more will arrive.
    EndOfStream,
    /// The wait elapsed without a message.
    Timeout,
}
