//! Redis Streams adapters (durable, at-least-once delivery).
//!
//! - **Outbound**: [`RedisStreamsPublisher`] appends outbox rows to the
//!   transaction stream with `XADD`.
//! - **Inbound**: [`RedisHoldEventConsumer`] reads hold events through a
//!   consumer group. Settled messages are acknowledged; failed ones stay in
//!   the pending list. Once idle for `min_idle` they are reclaimed with
//!   `XCLAIM` and retried until `max_deliveries`, then copied to
//!   `<stream>:dlq` and acknowledged.
//!
//! ## Entry fields
//!
//! | Stream | Fields |
//! |--------|--------|
//! | transactions | `key`, `event_type`, `event_id`, `payload` |
//! | holds | `event_type` (optional, falls back to `eventType` in the payload), `payload` |
//! | `<holds>:dlq` | `original_message_id`, `event_type`, `payload`, `error`, `delivery_count`, `failed_at` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use creditx_events::{EventStream, InboundMessage, StreamError, StreamMessage};

use crate::error::ServiceResult;
use crate::saga::{HoldEventProcessor, ProcessOutcome};
use crate::store::LedgerStore;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

async fn connect(redis_url: &str) -> Result<ConnectionManager, RedisStreamsError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
    client
        .get_connection_manager()
        .await
        .map_err(|e| RedisStreamsError::Connection(e.to_string()))
}

/// Publishes outbox rows to the transaction stream.
#[derive(Clone)]
pub struct RedisStreamsPublisher {
    conn: ConnectionManager,
    stream_key: String,
}

impl RedisStreamsPublisher {
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        Ok(Self {
            conn: connect(redis_url).await?,
            stream_key: stream_key.into(),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

fn stream_error(err: redis::RedisError) -> StreamError {
    if err.is_timeout() {
        StreamError::Timeout
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StreamError::Unavailable(err.to_string())
    } else {
        StreamError::Rejected(err.to_string())
    }
}

#[async_trait]
impl EventStream for RedisStreamsPublisher {
    #[instrument(
        skip(self, message),
        fields(stream_key = %self.stream_key, key = %message.key, event_type = %message.event_type),
        err
    )]
    async fn publish(&self, message: &StreamMessage) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("key")
            .arg(&message.key)
            .arg("event_type")
            .arg(&message.event_type)
            .arg("event_id")
            .arg(&message.event_id)
            .arg("payload")
            .arg(&message.payload)
            .query_async(&mut conn)
            .await
            .map_err(stream_error)?;
        Ok(())
    }
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct HoldEventConsumerConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    /// Deliveries before a failing message is dead-lettered
    pub max_deliveries: u64,
    /// Entries per read
    pub batch_size: usize,
    /// How long a read waits for new entries
    pub block: Duration,
    /// How long a failed entry sits in the pending list before it is retried
    pub min_idle: Duration,
}

impl HoldEventConsumerConfig {
    pub fn new(stream_key: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: "ledger-1".to_string(),
            max_deliveries: 5,
            batch_size: 16,
            block: Duration::from_millis(1000),
            min_idle: Duration::from_secs(5),
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u64) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn dlq_key(&self) -> String {
        format!("{}:dlq", self.stream_key)
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub read_errors: u64,
}

/// What to do with a delivered entry after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Ack,
    Retry,
    DeadLetter(String),
}

fn disposition(result: &ServiceResult<ProcessOutcome>, deliveries: u64, max_deliveries: u64) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(err) if !err.is_retryable() => Disposition::DeadLetter(err.to_string()),
        Err(err) if deliveries >= max_deliveries => {
            Disposition::DeadLetter(format!("gave up after {deliveries} deliveries: {err}"))
        }
        Err(_) => Disposition::Retry,
    }
}

/// One row of the extended `XPENDING` reply: id, consumer, idle ms, deliveries.
type PendingRow = (String, String, u64, u64);

/// Pending entries idle for at least `min_idle`, with their delivery counts.
fn due_for_retry(pending: Vec<PendingRow>, min_idle: Duration) -> Vec<(String, u64)> {
    let min_idle_ms = min_idle.as_millis() as u64;
    pending
        .into_iter()
        .filter(|(_, _, idle_ms, _)| *idle_ms >= min_idle_ms)
        .map(|(id, _, _, deliveries)| (id, deliveries))
        .collect()
}

/// Read `event_type`/`payload` from a stream entry. `None` when the payload is
/// missing.
fn inbound_from_entry(entry: &StreamId) -> Option<InboundMessage> {
    let payload: String = entry.get("payload")?;
    let event_type: Option<String> = entry.get("event_type");
    Some(InboundMessage::new(event_type, payload))
}

/// Consumer-group reader feeding the [`HoldEventProcessor`].
pub struct RedisHoldEventConsumer<S> {
    conn: ConnectionManager,
    processor: Arc<HoldEventProcessor<S>>,
    config: HoldEventConsumerConfig,
}

impl<S> RedisHoldEventConsumer<S>
where
    S: LedgerStore + 'static,
{
    pub async fn connect(
        redis_url: &str,
        processor: Arc<HoldEventProcessor<S>>,
        config: HoldEventConsumerConfig,
    ) -> Result<Self, RedisStreamsError> {
        let consumer = Self {
            conn: connect(redis_url).await?,
            processor,
            config,
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn ensure_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    /// Retry this consumer's pending entries that have been idle long enough,
    /// then wait for new ones.
    pub async fn poll_once(&self, stats: &Mutex<ConsumerStats>) -> Result<(), RedisStreamsError> {
        let due = due_for_retry(self.pending().await?, self.config.min_idle);
        if !due.is_empty() {
            // XCLAIM bumps the delivery count and resets the idle timer.
            let deliveries: HashMap<String, u64> = due
                .iter()
                .map(|(id, count)| (id.clone(), count + 1))
                .collect();
            let ids: Vec<&str> = due.iter().map(|(id, _)| id.as_str()).collect();
            for entry in &self.claim(&ids).await? {
                let count = deliveries.get(&entry.id).copied().unwrap_or(1);
                self.handle(entry, count, stats).await?;
            }
        }

        let fresh = self.read(">", Some(self.config.block)).await?;
        for entry in &fresh {
            self.handle(entry, 1, stats).await?;
        }
        Ok(())
    }

    async fn read(&self, id: &str, block: Option<Duration>) -> Result<Vec<StreamId>, RedisStreamsError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(self.config.batch_size);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.config.stream_key).arg(id);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    /// This consumer's pending entries.
    async fn pending(&self) -> Result<Vec<PendingRow>, RedisStreamsError> {
        let mut conn = self.conn.clone();
        redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size)
            .arg(&self.config.consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))
    }

    /// Take pending entries back for this consumer. Entries another reader
    /// touched within `min_idle` are left alone and not returned.
    async fn claim(&self, ids: &[&str]) -> Result<Vec<StreamId>, RedisStreamsError> {
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.min_idle.as_millis() as u64)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;
        Ok(reply.ids)
    }

    async fn handle(
        &self,
        entry: &StreamId,
        deliveries: u64,
        stats: &Mutex<ConsumerStats>,
    ) -> Result<(), RedisStreamsError> {
        lock_stats(stats).received += 1;

        let Some(message) = inbound_from_entry(entry) else {
            self.dead_letter(entry, None, "entry has no payload field", deliveries)
                .await?;
            lock_stats(stats).dead_lettered += 1;
            return Ok(());
        };

        let result = self.processor.handle_message(&message).await;
        match disposition(&result, deliveries, self.config.max_deliveries) {
            Disposition::Ack => {
                self.ack(&entry.id).await?;
                lock_stats(stats).acknowledged += 1;
                debug!(message_id = %entry.id, outcome = ?result.ok(), "hold event acknowledged");
            }
            Disposition::Retry => {
                lock_stats(stats).retried += 1;
                debug!(message_id = %entry.id, deliveries, "hold event left pending for retry");
            }
            Disposition::DeadLetter(reason) => {
                self.dead_letter(entry, Some(&message), &reason, deliveries).await?;
                lock_stats(stats).dead_lettered += 1;
            }
        }
        Ok(())
    }

    async fn ack(&self, message_id: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(message_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        entry: &StreamId,
        message: Option<&InboundMessage>,
        reason: &str,
        deliveries: u64,
    ) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.config.dlq_key())
            .arg("*")
            .arg("original_message_id")
            .arg(&entry.id)
            .arg("event_type")
            .arg(message.and_then(|m| m.event_type.clone()).unwrap_or_default())
            .arg("payload")
            .arg(message.map(|m| m.payload.clone()).unwrap_or_default())
            .arg("error")
            .arg(reason)
            .arg("delivery_count")
            .arg(deliveries)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(
            message_id = %entry.id,
            delivery_count = deliveries,
            %reason,
            "hold event sent to dead-letter stream"
        );
        self.ack(&entry.id).await
    }

    /// Run the consumer as a background task.
    pub fn spawn(self) -> RedisHoldEventConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let task_stats = stats.clone();

        let join = tokio::spawn(async move {
            info!(
                stream_key = %self.config.stream_key,
                group = %self.config.group,
                consumer = %self.config.consumer,
                "hold event consumer started"
            );
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    polled = self.poll_once(&task_stats) => {
                        if let Err(err) = polled {
                            lock_stats(&task_stats).read_errors += 1;
                            error!(error = %err, "hold event poll failed");
                            tokio::time::sleep(self.config.block).await;
                        }
                    }
                }
            }
            info!("hold event consumer stopped");
        });

        RedisHoldEventConsumerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

fn lock_stats(stats: &Mutex<ConsumerStats>) -> MutexGuard<'_, ConsumerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct RedisHoldEventConsumerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl RedisHoldEventConsumerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.join.await {
            error!(error = %err, "hold event consumer task ended abnormally");
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        lock_stats(&self.stats).clone()
    }
}
