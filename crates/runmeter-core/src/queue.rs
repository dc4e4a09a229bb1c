// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue seam.
//!
//! Delivery is at-least-once: a message stays in flight until it is acked
//! and goes back to the queue on [`JobQueue::requeue_in_flight`]. The worker
//! is idempotent against redelivery because a run leaves `QUEUED` exactly
//! once.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{Error, Result};

/// Work item delivered to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Run to execute.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Handler selector.
    pub job_type: String,
    /// Job input.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A received message plus whatever the backend needs to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Decoded message.
    pub message: JobMessage,
    raw: String,
}

fn decode(raw: String) -> Option<Delivery> {
    match serde_json::from_str::<JobMessage>(&raw) {
        Ok(message) => Some(Delivery { message, raw }),
        Err(e) => {
            warn!(error = %e, body = %raw, "Dropping undecodable queue message");
            None
        }
    }
}

/// At-least-once job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message.
    async fn send(&self, message: &JobMessage) -> Result<()>;

    /// Receive up to `max` messages, waiting at most `wait` for the first.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return every unacked in-flight message to the queue. Returns the count.
    async fn requeue_in_flight(&self) -> Result<usize>;
}

// ============================================================================
// In-memory queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    in_flight: Vec<String>,
}

/// Process-local queue with the same delivery semantics as the Redis one.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for delivery.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages delivered but not acked.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, max: usize) -> Vec<Delivery> {
        let mut state = self.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(raw) = state.ready.pop_front() else {
                break;
            };
            if let Some(delivery) = decode(raw) {
                state.in_flight.push(delivery.raw.clone());
                out.push(delivery);
            }
        }
        out
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send(&self, message: &JobMessage) -> Result<()> {
        let raw = serde_json::to_string(message)?;
        self.lock().ready.push_back(raw);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let batch = self.take(max);
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        Ok(self.take(max))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.lock();
        if let Some(pos) = state.in_flight.iter().position(|raw| raw == &delivery.raw) {
            state.in_flight.remove(pos);
        }
        Ok(())
    }

    async fn requeue_in_flight(&self) -> Result<usize> {
        let mut state = self.lock();
        let pending: Vec<String> = state.in_flight.drain(..).collect();
        let count = pending.len();
        for raw in pending.into_iter().rev() {
            state.ready.push_front(raw);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }
}

// ============================================================================
// Redis queue
// ============================================================================

/// Reliable list queue.
///
/// Producers `LPUSH` onto `<name>`; consumers `BLMOVE` from its tail into
/// `<name>:processing` and `LREM` on ack. Blocking receives run on a
/// dedicated connection so they never stall ledger traffic.
pub struct RedisJobQueue {
    conn: ConnectionManager,
    blocking: tokio::sync::Mutex<MultiplexedConnection>,
    queue_key: String,
    processing_key: String,
}

fn queue_err(e: redis::RedisError) -> Error {
    Error::Queue(e.to_string())
}

impl RedisJobQueue {
    /// Connect to `redis_url` and use the list `name`.
    pub async fn connect(redis_url: &str, name: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(queue_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(queue_err)?;
        let blocking = client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_err)?;
        let queue_key = name.into();
        Ok(Self {
            conn,
            blocking: tokio::sync::Mutex::new(blocking),
            processing_key: format!("{}:processing", queue_key),
            queue_key,
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn send(&self, message: &JobMessage) -> Result<()> {
        let raw = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        // BLMOVE treats 0 as "block forever".
        let timeout = wait.as_secs_f64().max(0.01);
        let first: Option<String> = {
            let mut blocking = self.blocking.lock().await;
            redis::cmd("BLMOVE")
                .arg(&self.queue_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(timeout)
                .query_async(&mut *blocking)
                .await
                .map_err(queue_err)?
        };
        let Some(first) = first else {
            return Ok(Vec::new());
        };

        let mut raws = vec![first];
        let mut conn = self.conn.clone();
        while raws.len() < max {
            let next: Option<String> = redis::cmd("LMOVE")
                .arg(&self.queue_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(queue_err)?;
            match next {
                Some(raw) => raws.push(raw),
                None => break,
            }
        }

        Ok(raws.into_iter().filter_map(decode).collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.raw)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn requeue_in_flight(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut count = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(queue_err)?;
            if moved.is_none() {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}
