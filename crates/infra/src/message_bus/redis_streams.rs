//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! - **Stream per partition**: `{prefix}:{topic}:{partition}`
//! - **Consumer groups**: created on first subscribe, reading from the start of
//!   the stream, so a new group sees everything still retained
//! - **Entries**: `key` (partition key) and `payload` (JSON message)
//!
//! Each subscription runs a named poll thread that reads with `XREADGROUP` and
//! forwards [`Delivery`] values into the channel behind [`Subscription`]. An
//! entry is acknowledged (`XACK`) only when the consumer acks its delivery.
//! Unacknowledged entries stay in the group's pending list; the poll thread
//! periodically claims entries idle for longer than [`CLAIM_MIN_IDLE`] (any
//! consumer's, so a crashed consumer's backlog moves to a live one) and
//! delivers them again. Entries delivered more than [`MAX_DELIVERIES`] times,
//! and entries that cannot be decoded, are acknowledged and dropped.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use loadcache_events::{Ack, Delivery, Keyed, MessageBus, Subscription, partition_for};

const DEFAULT_PREFIX: &str = "loadcache";

/// Entries read per `XREADGROUP` call.
const READ_COUNT: usize = 10;

/// How long `XREADGROUP` blocks waiting for new entries.
const BLOCK_MS: u64 = 100;

/// Back-off after a failed read before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Pending entries idle this long are claimed and delivered again.
pub const CLAIM_MIN_IDLE: Duration = Duration::from_secs(30);

/// How often the poll thread looks for idle pending entries.
const CLAIM_INTERVAL: Duration = Duration::from_secs(5);

/// Deliveries after which a pending entry is dropped instead of claimed.
pub const MAX_DELIVERIES: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("partition {partition} out of range (topic has {partition_count})")]
    InvalidPartition { partition: u32, partition_count: u32 },
}

pub struct RedisStreamsMessageBus<M> {
    client: Arc<redis::Client>,
    prefix: String,
    partition_count: u32,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for RedisStreamsMessageBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            prefix: self.prefix.clone(),
            partition_count: self.partition_count,
            _message: PhantomData,
        }
    }
}

impl<M> core::fmt::Debug for RedisStreamsMessageBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsMessageBus")
            .field("prefix", &self.prefix)
            .field("partition_count", &self.partition_count)
            .finish()
    }
}

impl<M> RedisStreamsMessageBus<M> {
    /// Create a bus over `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// `prefix` namespaces the stream keys (default: "loadcache").
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        partition_count: u32,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            partition_count: partition_count.max(1),
            _message: PhantomData,
        })
    }

    fn stream_key(&self, topic: &str, partition: u32) -> String {
        stream_key(&self.prefix, topic, partition)
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists on a stream (idempotent).
    fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => {
                debug!(stream = %stream, group = %group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }
}

fn stream_key(prefix: &str, topic: &str, partition: u32) -> String {
    format!("{prefix}:{topic}:{partition}")
}

impl<M> MessageBus<M> for RedisStreamsMessageBus<M>
where
    M: Keyed + Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisStreamsError;

    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let partition = partition_for(message.partition_key(), self.partition_count);
        let stream = self.stream_key(topic, partition);

        let mut conn = self.connection()?;
        let id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("key")
            .arg(message.partition_key())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        debug!(stream = %stream, message_id = %id, "message published");
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Subscription<M>, Self::Error> {
        if partition >= self.partition_count {
            return Err(RedisStreamsError::InvalidPartition {
                partition,
                partition_count: self.partition_count,
            });
        }

        let stream = self.stream_key(topic, partition);
        self.ensure_consumer_group(&stream, group)?;

        let poller = StreamPoller {
            client: Arc::clone(&self.client),
            stream: stream.clone(),
            group: group.to_string(),
            consumer: format!("{group}-{}", uuid::Uuid::now_v7()),
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("redis-poll-{stream}"))
            .spawn(move || poller.run(tx))
            .map_err(|e| RedisStreamsError::Connection(format!("spawning poll thread: {e}")))?;

        Ok(Subscription::new(rx))
    }
}

/// Entry read from a stream.
#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    payload: String,
}

/// Decoded entries of one read, plus ids to acknowledge without delivering.
#[derive(Debug)]
struct DecodedBatch<M> {
    messages: Vec<(String, M)>,
    rejected: Vec<String>,
}

/// Entry in the group's pending list (`XPENDING` extended form).
#[derive(Debug, Clone, PartialEq)]
struct PendingEntry {
    id: String,
    deliveries: u64,
}

struct StreamPoller {
    client: Arc<redis::Client>,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamPoller {
    fn run<M: DeserializeOwned>(self, tx: mpsc::Sender<Delivery<M>>) {
        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "stream subscription started");

        let (ack_tx, ack_rx) = mpsc::channel::<String>();
        let mut conn = None;
        let mut last_claim: Option<Instant> = None;

        loop {
            if conn.is_none() {
                match self.client.get_connection() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        error!(stream = %self.stream, error = %e, "failed to connect to redis");
                        thread::sleep(ERROR_BACKOFF);
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else { continue };

            let acked: Vec<String> = ack_rx.try_iter().collect();
            if let Err(e) = self.acknowledge(c, &acked) {
                // Left pending; claimed and delivered again once idle.
                error!(stream = %self.stream, error = %e, count = acked.len(), "failed to acknowledge entries");
            }

            let claim_due = last_claim.is_none_or(|at| at.elapsed() >= CLAIM_INTERVAL);
            let raw = if claim_due {
                last_claim = Some(Instant::now());
                self.claim_idle(c)
            } else {
                self.read(c)
            };
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => {
                    error!(stream = %self.stream, error = %e, "failed to read from stream");
                    conn = None;
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            };

            let batch = decode_batch::<M>(raw);
            if let Err(e) = self.acknowledge(c, &batch.rejected) {
                error!(stream = %self.stream, error = %e, "failed to acknowledge undecodable entries");
            }

            for (id, message) in batch.messages {
                let ack_tx = ack_tx.clone();
                let ack = Ack::new(move || {
                    let _ = ack_tx.send(id);
                });
                if tx.send(Delivery::with_ack(message, ack)).is_err() {
                    let acked: Vec<String> = ack_rx.try_iter().collect();
                    if let Err(e) = self.acknowledge(c, &acked) {
                        error!(stream = %self.stream, error = %e, "failed to acknowledge entries");
                    }
                    info!(stream = %self.stream, consumer = %self.consumer, "subscriber dropped; stopping poll");
                    return;
                }
            }
        }
    }

    fn read(&self, conn: &mut redis::Connection) -> Result<Vec<redis::Value>, RedisStreamsError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        parse_read_reply(reply)
    }

    /// Claim pending entries idle for at least [`CLAIM_MIN_IDLE`] into this consumer.
    fn claim_idle(&self, conn: &mut redis::Connection) -> Result<Vec<redis::Value>, RedisStreamsError> {
        let min_idle_ms = CLAIM_MIN_IDLE.as_millis().to_string();

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(&min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(READ_COUNT)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

        let pending = pending
            .into_iter()
            .map(|(id, _consumer, _idle, deliveries)| PendingEntry { id, deliveries })
            .collect();
        let (claimable, exhausted) = split_pending(pending, MAX_DELIVERIES);

        if !exhausted.is_empty() {
            warn!(stream = %self.stream, ids = ?exhausted, "dropping entries delivered too many times");
            self.acknowledge(conn, &exhausted)?;
        }
        if claimable.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(&min_idle_ms)
            .arg(&claimable[..])
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

        debug!(stream = %self.stream, count = claimed.len(), "claimed idle pending entries");
        Ok(claimed)
    }

    fn acknowledge(&self, conn: &mut redis::Connection, ids: &[String]) -> Result<(), RedisStreamsError> {
        if ids.is_empty() {
            return Ok(());
        }

        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(ids)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

/// Parse an `XREADGROUP` reply for a single stream into its raw entries.
///
/// Format: `[[stream_key, [[id, [field, value, ...]], ...]]]`, or nil when the
/// block timed out.
fn parse_read_reply(reply: redis::Value) -> Result<Vec<redis::Value>, RedisStreamsError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        other => {
            return Err(RedisStreamsError::Deserialization(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    let mut entries = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            return Err(RedisStreamsError::Deserialization("invalid stream format".to_string()));
        };
        if parts.len() != 2 {
            return Err(RedisStreamsError::Deserialization("stream reply too short".to_string()));
        }
        let redis::Value::Bulk(raw_entries) = parts.swap_remove(1) else {
            return Err(RedisStreamsError::Deserialization("invalid entries format".to_string()));
        };
        entries.extend(raw_entries);
    }
    Ok(entries)
}

/// Decode raw entries one by one; a bad entry never fails the batch.
fn decode_batch<M: DeserializeOwned>(raw: Vec<redis::Value>) -> DecodedBatch<M> {
    let mut batch = DecodedBatch {
        messages: Vec::with_capacity(raw.len()),
        rejected: Vec::new(),
    };

    for value in raw {
        // XCLAIM reports entries deleted from the stream as nil.
        if matches!(value, redis::Value::Nil) {
            continue;
        }
        let id = entry_id(&value);
        let decoded = parse_entry(value).and_then(|entry| {
            serde_json::from_str::<M>(&entry.payload)
                .map(|message| (entry.id, message))
                .map_err(|e| RedisStreamsError::Deserialization(e.to_string()))
        });
        match (decoded, id) {
            (Ok(decoded), _) => batch.messages.push(decoded),
            (Err(e), Some(id)) => {
                warn!(message_id = %id, error = %e, "dropping undecodable entry");
                batch.rejected.push(id);
            }
            (Err(e), None) => warn!(error = %e, "skipping entry without id"),
        }
    }
    batch
}

/// Split pending entries into ids to claim and ids past `max_deliveries`.
fn split_pending(pending: Vec<PendingEntry>, max_deliveries: u64) -> (Vec<String>, Vec<String>) {
    let (exhausted, claimable): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|entry| entry.deliveries > max_deliveries);
    (
        claimable.into_iter().map(|entry| entry.id).collect(),
        exhausted.into_iter().map(|entry| entry.id).collect(),
    )
}

fn entry_id(entry: &redis::Value) -> Option<String> {
    match entry {
        redis::Value::Bulk(parts) => match parts.first() {
            Some(redis::Value::Data(id)) => Some(String::from_utf8_lossy(id).into_owned()),
            _ => None,
        },
        _ => None,
    }
}

fn parse_entry(entry: redis::Value) -> Result<StreamEntry, RedisStreamsError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(RedisStreamsError::Deserialization("invalid entry format".to_string()));
    };

    let (Some(redis::Value::Data(id)), Some(redis::Value::Bulk(raw_fields))) =
        (parts.first(), parts.get(1))
    else {
        return Err(RedisStreamsError::Deserialization("invalid entry format".to_string()));
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [redis::Value::Data(name), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
    }

    let payload = fields
        .remove("payload")
        .ok_or_else(|| RedisStreamsError::Deserialization("missing payload field".to_string()))?;

    Ok(StreamEntry {
        id: String::from_utf8_lossy(id).into_owned(),
        payload,
    })
}
