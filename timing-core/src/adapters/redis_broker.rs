//! Redis-backed `Broker`: `XADD`/`XREADGROUP`/`XACK` streams plus
//! pub/sub and small string/hash caches.
//!
//! Grounded on `db::create_pool`'s shape (a thin constructor wrapping a
//! connection handle, logged on connect) with the connection type
//! swapped for `redis::aio::ConnectionManager`, which auto-reconnects
//! the way a pool hands out fresh connections.

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::info;

use crate::ports::{Broker, PortError, PortResult, StreamField};

pub struct RedisBroker {
    connection: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %redact(url), "connected to redis broker");
        Ok(Self { connection })
    }
}

fn redact(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("redis://***@{host}"),
        None => url.to_string(),
    }
}

impl Broker for RedisBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> PortResult<()> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(PortError::Broker(e.to_string())),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> PortResult<Vec<StreamField>> {
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default().group(group, consumer).count(batch_size);

        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|e| PortError::Broker(e.to_string()))?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                for (name, value) in id.map {
                    if let redis::Value::BulkString(bytes) = value {
                        out.push(StreamField { id: id.id.clone(), name, value: bytes });
                    }
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> PortResult<()> {
        let mut conn = self.connection.clone();
        conn.xack(stream, group, &[id])
            .await
            .map_err(|e: redis::RedisError| PortError::Broker(e.to_string()))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> PortResult<()> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| PortError::Broker(e.to_string()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> PortResult<()> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| PortError::Broker(e.to_string()))
    }

    async fn get(&self, key: &str) -> PortResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(|e| PortError::Broker(e.to_string()))
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> PortResult<()> {
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| PortError::Broker(e.to_string()))
    }
}
