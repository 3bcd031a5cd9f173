//! Redis backend: pub/sub channels and Redis streams.
use async_trait::async_trait;
use deadpool_redis::{Manager, Pool};
use futures::StreamExt;
use log::*;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo, Value};
use std::time::Duration;

use crate::error::{BrokerErrorKind, Error, Result};
use crate::{Broker, EntryId, LogEntry, Publication, Subscription};

/// Redis broker.
///
/// Commands (`PUBLISH`, `XADD`, `XREAD`) run on connections taken from a
/// fixed-size pool and returned as soon as the command completes. A blocking
/// `XREAD` holds its connection for at most the block timeout. Every
/// subscription opens its own dedicated connection, which is closed when the
/// subscription stream is dropped.
pub struct RedisBroker {
    client: Client,
    pool: Pool,
}

impl RedisBroker {
    /// Connect to Redis at `url`, overriding the password and database index
    /// carried in the URL when given. Fails if the first pooled connection
    /// cannot be established.
    pub async fn connect(
        url: &str,
        password: Option<&str>,
        db: Option<i64>,
        max_connections: usize,
    ) -> Result<Self> {
        let info = Self::connection_info(url, password, db)?;

        let client = Client::open(info.clone())?;
        let manager = Manager::new(info)?;
        let pool = Pool::builder(manager).max_size(max_connections).build()?;

        let mut conn = pool.get().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;

        info!("Connected to Redis broker, pool max_size={max_connections}");

        Ok(Self { client, pool })
    }

    fn connection_info(url: &str, password: Option<&str>, db: Option<i64>) -> Result<ConnectionInfo> {
        let mut info = url.into_connection_info()?;
        if let Some(password) = password {
            info.redis.password = Some(password.to_string());
        }
        if let Some(db) = db {
            info.redis.db = db;
        }
        Ok(info)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        debug!("Subscribed to Redis channel {channel}");

        let publications = pubsub.into_on_message().map(|msg| Publication {
            channel: msg.get_channel_name().to_string(),
            payload: String::from_utf8_lossy(msg.get_payload_bytes()).into_owned(),
        });

        Ok(publications.boxed())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64> {
        let mut conn = self.connection().await?;
        let subscribers: i64 = conn.publish(channel, payload).await?;
        Ok(subscribers)
    }

    async fn append(&self, log: &str, fields: &[(String, Vec<u8>)]) -> Result<EntryId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(log).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value.as_slice());
        }

        let mut conn = self.connection().await?;
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id.parse()?)
    }

    async fn read_after(
        &self,
        log: &str,
        after: &EntryId,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let options = StreamReadOptions::default().block(block.as_millis() as usize);

        let mut conn = self.connection().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[log], &[after.to_string()], &options)
            .await?;

        // A nil reply means the block timeout elapsed without new entries.
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for stream_id in key.ids {
                let id = stream_id.id.parse::<EntryId>()?;
                let fields = stream_id
                    .map
                    .into_iter()
                    .map(|(field, value)| Ok((field, field_value(&value)?)))
                    .collect::<Result<Vec<_>>>()?;
                entries.push(LogEntry { id, fields });
            }
        }

        Ok(entries)
    }
}

fn field_value(value: &Value) -> Result<String> {
    let bytes: Vec<u8> = redis::from_redis_value(value).map_err(|e| Error {
        error_kind: BrokerErrorKind::Decode(format!("unreadable stream field value: {value:?}")),
        source: Some(Box::new(e)),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
