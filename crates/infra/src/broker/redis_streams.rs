//! Redis Streams-backed task broker (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `parley:tasks`, one entry per ready task (`task` field holds the JSON envelope)
//! - **Consumer Group**: `ai.process_session`, shared by every worker slot
//! - **Consumers**: one per worker slot (e.g. `worker-0`, `worker-1`)
//! - **Delayed Set**: `parley:tasks:delayed`, a sorted set of retries scored by their
//!   not-before time in milliseconds; due members are moved into the stream atomically
//!
//! ## Leases
//!
//! An entry read with XREADGROUP sits in the group's pending list until it is
//! acknowledged. `heartbeat` re-claims it with a zero idle time, which resets
//! its idle counter. Entries idle for longer than the visibility timeout belong
//! to a dead consumer and are claimed by the next consumer that asks for work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, error, instrument, warn};

use parley_tasks::{BrokerError, Delivery, TaskBroker, TaskEnvelope};

use crate::worker::retry::saturating_millis;

/// Default stream key for tasks
const DEFAULT_STREAM_KEY: &str = "parley:tasks";

/// Default consumer group
const DEFAULT_GROUP: &str = parley_tasks::PROCESS_SESSION_TASK;

/// Upper bound on how long `receive` sleeps between polls.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Due retries moved into the stream per poll.
const PROMOTE_BATCH: usize = 16;

const TASK_FIELD: &str = "task";

/// Moves due members of the delayed set (KEYS[1]) into the stream (KEYS[2]).
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('XADD', KEYS[2], '*', 'task', member)
end
return #due
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub stream_key: String,
    pub group: String,
    /// Idle time after which an unacknowledged entry is handed to another consumer.
    pub visibility_timeout: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

impl RedisStreamsConfig {
    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.stream_key)
    }
}

#[derive(Clone)]
pub struct RedisStreamsTaskBroker {
    conn: MultiplexedConnection,
    config: Arc<RedisStreamsConfig>,
    promote: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisStreamsTaskBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsTaskBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn unavailable(op: &str, e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(format!("{op} failed: {e}"))
}

impl RedisStreamsTaskBroker {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(redis_url: &str, config: RedisStreamsConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(|e| unavailable("open", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable("connect", e))?;

        let broker = Self {
            conn,
            config: Arc::new(config),
            promote: Arc::new(redis::Script::new(PROMOTE_SCRIPT)),
        };
        broker.ensure_consumer_group().await?;
        Ok(broker)
    }

    /// XGROUP CREATE ... MKSTREAM, tolerating an existing group.
    pub async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(unavailable("XGROUP CREATE", e)),
        }
    }

    fn encode(task: &TaskEnvelope) -> Result<String, BrokerError> {
        serde_json::to_string(task).map_err(|e| BrokerError::Serialization(e.to_string()))
    }

    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let moved: usize = self
            .promote
            .key(self.config.delayed_key())
            .key(&self.config.stream_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await
            .map_err(|e| unavailable("promote delayed", e))?;

        if moved > 0 {
            debug!(moved, "promoted due retries into the stream");
        }
        Ok(())
    }

    /// Claim the oldest entry whose lease expired.
    async fn claim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<StreamId>, BrokerError> {
        let idle_ms = saturating_millis(self.config.visibility_timeout);

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XPENDING", e))?;

        let Some(expired) = pending.ids.into_iter().next() else {
            return Ok(None);
        };

        // Another consumer may win the race; XCLAIM then returns nothing.
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(consumer)
            .arg(idle_ms)
            .arg(&expired.id)
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XCLAIM", e))?;

        if claimed.ids.is_empty() {
            return Ok(None);
        }

        warn!(
            entry_id = %expired.id,
            previous_consumer = %expired.consumer,
            consumer,
            times_delivered = expired.times_delivered,
            "lease expired; redelivering task"
        );
        Ok(claimed.ids.into_iter().next())
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<StreamId>, BrokerError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.config.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XREADGROUP", e))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    /// Turn a stream entry into a delivery. Entries that cannot be decoded are
    /// removed so they do not block the group forever.
    async fn to_delivery(
        &self,
        conn: &mut MultiplexedConnection,
        entry: StreamId,
        consumer: &str,
        redelivered: bool,
    ) -> Result<Option<Delivery>, BrokerError> {
        let decoded = entry
            .get::<String>(TASK_FIELD)
            .ok_or_else(|| "missing task field".to_string())
            .and_then(|raw| serde_json::from_str::<TaskEnvelope>(&raw).map_err(|e| e.to_string()));

        match decoded {
            Ok(task) => Ok(Some(Delivery::new(entry.id, consumer, task, redelivered))),
            Err(reason) => {
                error!(entry_id = %entry.id, reason = %reason, "dropping undecodable stream entry");
                self.settle(conn, &entry.id).await?;
                Ok(None)
            }
        }
    }

    async fn settle(&self, conn: &mut MultiplexedConnection, entry_id: &str) -> Result<(), BrokerError> {
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream_key)
            .arg(entry_id)
            .ignore()
            .query_async::<_, ()>(conn)
            .await
            .map_err(|e| unavailable("XACK", e))
    }

    /// Whether `delivery` is still pending for its consumer.
    async fn owns(&self, conn: &mut MultiplexedConnection, delivery: &Delivery) -> Result<bool, BrokerError> {
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(delivery.tag())
            .arg(delivery.tag())
            .arg(1)
            .arg(delivery.consumer())
            .query_async(conn)
            .await
            .map_err(|e| unavailable("XPENDING", e))?;
        Ok(!pending.ids.is_empty())
    }

    async fn ensure_owned(&self, conn: &mut MultiplexedConnection, delivery: &Delivery) -> Result<(), BrokerError> {
        if self.owns(conn, delivery).await? {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery(delivery.tag().to_string()))
        }
    }
}

#[async_trait]
impl TaskBroker for RedisStreamsTaskBroker {
    #[instrument(
        skip(self, task),
        fields(stream_key = %self.config.stream_key, task_id = %task.task_id(), attempt = task.attempt()),
        err
    )]
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), BrokerError> {
        let payload = Self::encode(&task)?;
        let mut conn = self.conn.clone();

        match task.not_before() {
            Some(at) if at > Utc::now() => {
                redis::cmd("ZADD")
                    .arg(self.config.delayed_key())
                    .arg(at.timestamp_millis())
                    .arg(&payload)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| unavailable("ZADD", e))?;
            }
            _ => {
                redis::cmd("XADD")
                    .arg(&self.config.stream_key)
                    .arg("*")
                    .arg(TASK_FIELD)
                    .arg(&payload)
                    .query_async::<_, String>(&mut conn)
                    .await
                    .map_err(|e| unavailable("XADD", e))?;
            }
        }
        Ok(())
    }

    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.conn.clone();

        loop {
            self.promote_due(&mut conn).await?;

            if let Some(entry) = self.claim_expired(&mut conn, consumer).await? {
                if let Some(d) = self.to_delivery(&mut conn, entry, consumer, true).await? {
                    return Ok(Some(d));
                }
                continue;
            }

            if let Some(entry) = self.read_new(&mut conn, consumer).await? {
                if let Some(d) = self.to_delivery(&mut conn, entry, consumer, false).await? {
                    return Ok(Some(d));
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(deadline.saturating_duration_since(now).min(POLL_TICK)).await;
        }
    }

    #[instrument(skip(self, delivery), fields(entry_id = %delivery.tag(), consumer = %delivery.consumer()), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        self.ensure_owned(&mut conn, delivery).await?;
        self.settle(&mut conn, delivery.tag()).await
    }

    #[instrument(skip(self, delivery), fields(entry_id = %delivery.tag(), consumer = %delivery.consumer()), err)]
    async fn retry_later(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        self.ensure_owned(&mut conn, delivery).await?;

        let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let next = delivery.task().next_attempt(not_before);
        let payload = Self::encode(&next)?;

        // Publish the next attempt and settle the current one in one transaction.
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(self.config.delayed_key())
            .arg(not_before.timestamp_millis())
            .arg(&payload)
            .ignore()
            .cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(delivery.tag())
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream_key)
            .arg(delivery.tag())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable("retry_later", e))
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        self.ensure_owned(&mut conn, delivery).await?;

        let renewed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(delivery.consumer())
            .arg(0)
            .arg(delivery.tag())
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("XCLAIM", e))?;

        if renewed.is_empty() {
            return Err(BrokerError::UnknownDelivery(delivery.tag().to_string()));
        }
        Ok(())
    }
}
