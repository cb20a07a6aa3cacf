//! Redis Streams-backed message queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `{prefix}:{topic}`, one stream per topic
//! - **Consumer groups**: created on first use with `XGROUP CREATE ... 0 MKSTREAM`
//! - **Redelivery**: entries pending longer than the visibility timeout are
//!   reclaimed with `XPENDING` + `XCLAIM` before new entries are read
//! - **Max in flight**: when a group's pending list is full no new entries
//!   are read until some are acknowledged

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use campaigner_events::{Delivery, MessageQueue, Publisher, QueueError};

/// Default stream key prefix
const DEFAULT_PREFIX: &str = "campaigner";

/// Default visibility timeout (pending entries older than this are redelivered)
const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 60_000;

const DEFAULT_MAX_IN_FLIGHT: usize = 200;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    prefix: String,
    consumer_name: String,
    visibility_timeout_ms: u64,
    max_in_flight: usize,
    known_groups: Arc<Mutex<HashSet<(String, String)>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<RedisStreamsError> for QueueError {
    fn from(e: RedisStreamsError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

impl RedisStreamsQueue {
    /// Create a queue client.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - stream key prefix (default: "campaigner")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            known_groups: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists (idempotent).
    pub fn ensure_consumer_group(&self, topic: &str, group: &str) -> Result<(), RedisStreamsError> {
        let key = (topic.to_string(), group.to_string());
        if self.known_groups.lock().unwrap().contains(&key) {
            return Ok(());
        }

        let mut conn = self.connection()?;
        // Fails with BUSYGROUP when the group already exists, which is fine.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(topic))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        self.known_groups.lock().unwrap().insert(key);
        Ok(())
    }

    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key(topic), bytes = payload.len()), err)]
    fn publish_sync(&self, topic: &str, payload: &[u8]) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(topic))
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))?;
        Ok(())
    }

    fn pending_count(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        group: &str,
    ) -> Result<usize, RedisStreamsError> {
        // Summary form: [count, smallest id, greatest id, [[consumer, count]...]]
        let summary: redis::Value = redis::cmd("XPENDING")
            .arg(self.stream_key(topic))
            .arg(group)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {}", e)))?;

        match summary {
            redis::Value::Bulk(items) => match items.first() {
                Some(redis::Value::Int(n)) => Ok(usize::try_from(*n).unwrap_or(0)),
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }

    /// Claim one entry that has been pending longer than the visibility timeout.
    fn reclaim_expired(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        group: &str,
    ) -> Result<Option<Delivery>, RedisStreamsError> {
        let stream_key = self.stream_key(topic);
        let pending: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&stream_key)
            .arg(group)
            .arg("IDLE")
            .arg(self.visibility_timeout_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn);

        let (id, attempts) = match pending {
            Ok(entries) => match entries.into_iter().next() {
                Some((id, _, _, delivered)) => (id, delivered),
                None => return Ok(None),
            },
            Err(_) => return Ok(None),
        };

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&stream_key)
            .arg(group)
            .arg(&self.consumer_name)
            .arg(self.visibility_timeout_ms)
            .arg(&id)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {}", e)))?;

        // Another consumer may have claimed it first.
        let Some(entry) = claimed.into_iter().next() else {
            return Ok(None);
        };
        let (id, payload) = parse_stream_entry(entry)?;
        warn!(message_id = %id, attempts = attempts + 1, "reclaimed pending message");
        Ok(Some(Delivery {
            id,
            payload,
            attempts: u32::try_from(attempts + 1).unwrap_or(u32::MAX),
        }))
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        group: &str,
        block_ms: u64,
    ) -> Result<Option<Delivery>, RedisStreamsError> {
        // XREADGROUP with ">" to read entries never delivered to this group
        let result: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(self.stream_key(topic))
            .arg(">")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {}", e)))?;

        // Reply: nil on timeout, else [[stream_key, [[id, [field, value, ...]], ...]]]
        let streams = match result {
            redis::Value::Nil => return Ok(None),
            redis::Value::Bulk(streams) => streams,
            _ => {
                return Err(RedisStreamsError::Deserialization(
                    "unexpected XREADGROUP reply".to_string(),
                ));
            }
        };

        for stream in streams {
            let redis::Value::Bulk(parts) = stream else {
                continue;
            };
            let Some(redis::Value::Bulk(entries)) = parts.into_iter().nth(1) else {
                continue;
            };
            if let Some(entry) = entries.into_iter().next() {
                let (id, payload) = parse_stream_entry(entry)?;
                return Ok(Some(Delivery {
                    id,
                    payload,
                    attempts: 1,
                }));
            }
        }
        Ok(None)
    }

    fn receive_sync(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, RedisStreamsError> {
        self.ensure_consumer_group(topic, group)?;
        let mut conn = self.connection()?;

        if let Some(delivery) = self.reclaim_expired(&mut conn, topic, group)? {
            return Ok(Some(delivery));
        }

        if self.pending_count(&mut conn, topic, group)? >= self.max_in_flight {
            debug!(topic, group, "max in flight reached");
            std::thread::sleep(timeout);
            return Ok(None);
        }

        let block_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self.read_new(&mut conn, topic, group, block_ms)
    }

    fn ack_sync(&self, topic: &str, group: &str, id: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let acked: u64 = redis::cmd("XACK")
            .arg(self.stream_key(topic))
            .arg(group)
            .arg(id)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {}", e)))?;
        if acked == 0 {
            warn!(message_id = %id, "ack for message that was not pending");
        }
        Ok(())
    }
}

/// Parse `[id, [field, value, ...]]` into the id and the `payload` field.
fn parse_stream_entry(entry: redis::Value) -> Result<(String, Vec<u8>), RedisStreamsError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(RedisStreamsError::Deserialization("Invalid entry format".to_string()));
    };
    let mut parts = parts.into_iter();

    let id = match parts.next() {
        Some(redis::Value::Data(data)) => String::from_utf8_lossy(&data).to_string(),
        Some(redis::Value::Status(s)) => s,
        _ => {
            return Err(RedisStreamsError::Deserialization(
                "Invalid message ID format".to_string(),
            ));
        }
    };

    let Some(redis::Value::Bulk(fields)) = parts.next() else {
        return Err(RedisStreamsError::Deserialization("Invalid fields format".to_string()));
    };

    let mut fields = fields.into_iter();
    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
        if let (redis::Value::Data(key), redis::Value::Data(value)) = (key, value) {
            if key == b"payload" {
                return Ok((id, value));
            }
        }
    }
    Err(RedisStreamsError::Deserialization(format!(
        "Missing payload field in {}",
        id
    )))
}

impl Publisher for RedisStreamsQueue {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), QueueError> {
        Ok(self.publish_sync(topic, payload)?)
    }
}

impl MessageQueue for RedisStreamsQueue {
    fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        Ok(self.receive_sync(topic, group, timeout)?)
    }

    fn ack(&self, topic: &str, group: &str, delivery: &Delivery) -> Result<(), QueueError> {
        Ok(self.ack_sync(topic, group, &delivery.id)?)
    }
}
