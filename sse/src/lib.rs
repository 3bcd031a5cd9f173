//! Bridges broker channels and logs onto Server-Sent Events streams.
//!
//! # Architecture
//!
//! - **Source**: a family of named broker resources, either ephemeral
//!   pub/sub channels or durable append-only logs. It builds the receiving
//!   and sending halves for a given name.
//! - **Receiver**: one per streaming connection. A spawned listener moves
//!   broker traffic into a single-slot queue so a slow client pushes back on
//!   the broker read instead of buffering without bound.
//! - **Sender**: turns an ingest request body into a publish or an append.
//! - **EventStreamWriter**: the per-connection state machine that frames
//!   messages, keep-alives and the opening padding as SSE.
//!
//! # Message Flow
//!
//! 1. A client opens `GET <prefix>/<name>`, optionally with `Last-Event-ID`
//! 2. The source builds a receiver, subscribing or positioning the cursor
//! 3. The writer sends padding and the `retry:` hint, then streams frames
//! 4. A `POST <prefix>/<name>` goes through a sender to the broker
//! 5. The broker fans the message back out to every listening receiver
//! 6. Disconnect, end of stream or shutdown tears the receiver down
//!
//! Durable messages carry the log entry id as the SSE `id`, so a client
//! reconnecting with `Last-Event-ID` resumes right after the last entry it saw.

pub mod connection;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod source;
pub mod writer;

pub use connection::ConnectionId;
pub use error::{Error, ErrorKind, Result};
pub use message::{Delivery, Message};
pub use receiver::Receiver;
pub use sender::{IngestRequest, Outcome, Sender};
pub use source::Source;
pub use writer::{stream_headers, CloseReason, EventStreamWriter, Transport};
