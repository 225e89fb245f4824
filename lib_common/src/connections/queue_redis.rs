//! # Redis Streams Queue Backend
//!
//! Each queue is a Redis stream consumed through a consumer group.
//!
//! ## Mapping:
//!
//! | Queue operation | Redis command                                          |
//! |-----------------|--------------------------------------------------------|
//! | `assert_queue`  | `XGROUP CREATE <queue> <group> 0 MKSTREAM` (BUSYGROUP ok) |
//! | `next_delivery` | `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms`  |
//! | `ack`           | `XACK` then `XDEL`                                     |
//! | `nack(false)`   | `XACK` then `XDEL` (message discarded)                 |
//! | `nack(true)`    | entry left pending, re-read from the pending list      |
//! | `publish`       | `XADD <queue> * payload <bytes>`                       |
//!
//! Entries delivered to this consumer but never acknowledged (because the
//! previous process died) are read first, from the pending list, and are
//! flagged as redelivered. Only then does the channel switch to new entries.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use redis::Client;

use crate::connections::queue::{Delivery, QueueChannel, QueueConnector, QueueError};

/// Stream field holding the message body.
const PAYLOAD_FIELD: &str = "payload";

/// # Redis Stream Connector
#[derive(Debug, Clone)]
pub struct RedisStreamConnector {
    group: String,
    consumer: String,
    block: Duration,
    batch_size: usize,
}

impl RedisStreamConnector {
    /// A connector that joins consumer `group` as `consumer`.
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            block: Duration::from_millis(200),
            batch_size: 16,
        }
    }

    /// How long one `XREADGROUP` blocks waiting for new entries. Kept short so
    /// the consumer loop can observe shutdown between polls.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Maximum entries fetched per `XREADGROUP`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl QueueConnector for RedisStreamConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn QueueChannel>, QueueError> {
        let client = Client::open(url).map_err(|e| QueueError::Connect(e.to_string()))?;
        let mut con = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut con)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        log::info!("Connected to Redis at {}", url);

        Ok(Box::new(RedisStreamChannel {
            con: Some(con),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            block_ms: self.block.as_millis() as u64,
            batch_size: self.batch_size,
            queue: None,
            pending_cursor: Some("0".to_string()),
            buffered: VecDeque::new(),
        }))
    }
}

/// A consumer-group channel on one Redis connection.
pub struct RedisStreamChannel {
    con: Option<MultiplexedConnection>,
    group: String,
    consumer: String,
    block_ms: u64,
    batch_size: usize,
    queue: Option<String>,
    /// `Some(id)` while draining this consumer's pending list, starting after
    /// `id`. `None` once only new entries are read.
    pending_cursor: Option<String>,
    buffered: VecDeque<Delivery>,
}

impl RedisStreamChannel {
    fn parts(&mut self) -> Result<(&mut MultiplexedConnection, String), QueueError> {
        let queue = self.queue.clone().ok_or(QueueError::NotDeclared)?;
        let con = self.con.as_mut().ok_or(QueueError::Closed)?;
        Ok((con, queue))
    }

    async fn discard(&mut self, id: &str) -> Result<(), QueueError> {
        let group = self.group.clone();
        let (con, queue) = self.parts()?;

        let _: i64 = redis::cmd("XACK").arg(&queue).arg(&group).arg(id).query_async(con).await?;
        let _: i64 = redis::cmd("XDEL").arg(&queue).arg(id).query_async(con).await?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), QueueError> {
        let group = self.group.clone();
        let consumer = self.consumer.clone();
        let count = self.batch_size;
        let block_ms = self.block_ms;
        let cursor = self.pending_cursor.clone();
        let (con, queue) = self.parts()?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&group).arg(&consumer).arg("COUNT").arg(count);
        if cursor.is_none() {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS")
            .arg(&queue)
            .arg(cursor.as_deref().unwrap_or(">"));

        let reply: Option<StreamReadReply> = cmd.query_async(con).await?;
        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();

        let redelivered = cursor.is_some();
        if redelivered {
            match entries.last() {
                Some(last) => {
                    log::info!("Recovering {} pending entries from {}", entries.len(), queue);
                    self.pending_cursor = Some(last.id.clone());
                }
                None => self.pending_cursor = None,
            }
        }

        let mut orphans = Vec::new();
        for entry in entries {
            match entry.get::<Vec<u8>>(PAYLOAD_FIELD) {
                Some(payload) => self.buffered.push_back(Delivery {
                    tag: entry.id,
                    payload,
                    redelivered,
                }),
                None => orphans.push(entry.id),
            }
        }

        // Pending entries whose body was already deleted cannot be processed.
        for id in orphans {
            log::warn!("Dropping stream entry {} without a payload", id);
            self.discard(&id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for RedisStreamChannel {
    async fn assert_queue(&mut self, queue: &str) -> Result<(), QueueError> {
        let group = self.group.clone();
        let con = self.con.as_mut().ok_or(QueueError::Closed)?;

        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(con)
            .await;

        match created {
            Ok(_) => log::info!("Created consumer group {} on {}", group, queue),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                log::debug!("Consumer group {} already exists on {}", group, queue)
            }
            Err(e) => return Err(e.into()),
        }

        if self.queue.as_deref() != Some(queue) {
            self.queue = Some(queue.to_string());
            self.pending_cursor = Some("0".to_string());
            self.buffered.clear();
        }
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        if self.con.is_none() {
            return Err(QueueError::Closed);
        }
        if self.buffered.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffered.pop_front())
    }

    async fn ack(&mut self, delivery: Delivery) -> Result<(), QueueError> {
        self.discard(&delivery.tag).await
    }

    async fn nack(&mut self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            // Still pending for this consumer: read it again from the
            // pending list once the current batch is used up.
            self.parts()?;
            if self.pending_cursor.is_none() {
                self.pending_cursor = Some("0".to_string());
            }
            return Ok(());
        }
        self.discard(&delivery.tag).await
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let con = self.con.as_mut().ok_or(QueueError::Closed)?;
        let _: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(con)
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        if self.con.take().is_none() {
            return Err(QueueError::Closed);
        }
        if !self.buffered.is_empty() {
            log::info!(
                "Closing with {} unprocessed entries; they stay pending for redelivery",
                self.buffered.len()
            );
            self.buffered.clear();
        }
        Ok(())
    }
}
