//! Durable queue of pending workflow invocations.
//!
//! The dispatcher receives one message at a time, runs it, and acks it.
//! Payloads are kept as raw JSON so a message that no longer parses can be
//! dropped instead of poisoning the queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::model::WorkflowInvocation;

/// A message handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub msg_id: i64,
    /// Times this message has been read, including this one.
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub message: serde_json::Value,
}

/// Queue backend for invocations.
#[async_trait]
pub trait InvocationQueue: Send + Sync {
    /// Add an invocation. Returns the backend's message id.
    async fn enqueue(&self, invocation: &WorkflowInvocation) -> Result<i64>;

    /// Take the next message, if any. It stays owned by the caller until acked.
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Remove a received message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Messages waiting to be received.
    async fn len(&self) -> Result<usize>;
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    priority: i32,
    // Lower ids first among equal priorities.
    seq: Reverse<i64>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    ready: BinaryHeap<(Slot, i64)>,
    messages: std::collections::HashMap<i64, (DateTime<Utc>, serde_json::Value)>,
}

/// In-process queue: highest priority first, FIFO within a priority.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue stamping deliveries with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }

    /// Snapshot of waiting invocations in delivery order (for inspection).
    pub fn pending(&self) -> Vec<WorkflowInvocation> {
        let state = self.state.lock();
        let mut ready: Vec<_> = state.ready.iter().collect();
        ready.sort_by(|a, b| b.cmp(a));
        ready
            .into_iter()
            .filter_map(|(_, id)| state.messages.get(id))
            .filter_map(|(_, msg)| serde_json::from_value(msg.clone()).ok())
            .collect()
    }

    /// Push a raw payload, bypassing serialization. Lets tests inject
    /// messages that do not parse.
    pub fn push_raw(&self, message: serde_json::Value, priority: i32) -> i64 {
        let enqueued_at = self.clock.now();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.messages.insert(id, (enqueued_at, message));
        state.ready.push((
            Slot {
                priority,
                seq: Reverse(id),
            },
            id,
        ));
        id
    }
}

#[async_trait]
impl InvocationQueue for MemoryQueue {
    async fn enqueue(&self, invocation: &WorkflowInvocation) -> Result<i64> {
        let payload = serde_json::to_value(invocation)?;
        Ok(self.push_raw(payload, invocation.priority))
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock();
        let Some((_, id)) = state.ready.pop() else {
            return Ok(None);
        };
        let Some((enqueued_at, message)) = state.messages.get(&id).cloned() else {
            return Ok(None);
        };
        Ok(Some(Delivery {
            msg_id: id,
            read_ct: 1,
            enqueued_at,
            message,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state.lock().messages.remove(&delivery.msg_id);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().ready.len())
    }
}
