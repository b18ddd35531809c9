//! Invocation queue on pgmq via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.metrics. Delivery is FIFO; the invocation's priority
//! travels in the payload but pgmq does not reorder on it.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;

use super::Db;
use crate::error::Result;
use crate::model::WorkflowInvocation;
use crate::queue::{Delivery, InvocationQueue};
use crate::telemetry::metrics;

/// A named pgmq queue holding serialized [`WorkflowInvocation`]s.
#[derive(Clone)]
pub struct PgmqQueue {
    db: Arc<Db>,
    name: String,
    /// Seconds a read message stays hidden from other readers.
    visibility_timeout: i32,
}

impl PgmqQueue {
    pub fn new(db: Arc<Db>, name: impl Into<String>, visibility_timeout: i32) -> Self {
        Self {
            db,
            name: name.into(),
            visibility_timeout,
        }
    }

    /// Create the underlying pgmq queue (idempotent).
    pub async fn create(&self) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.name)
            .execute(self.db.pool())
            .await?;
        self.count("create");
        Ok(())
    }

    fn count(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

#[async_trait]
impl InvocationQueue for PgmqQueue {
    async fn enqueue(&self, invocation: &WorkflowInvocation) -> Result<i64> {
        let payload = serde_json::to_value(invocation)?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&self.name)
            .bind(&payload)
            .bind(0i32)
            .fetch_one(self.db.pool())
            .await?;
        self.count("send");
        Ok(row.0)
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)")
        .bind(&self.name)
        .bind(self.visibility_timeout)
        .fetch_optional(self.db.pool())
        .await?;

        let delivery = row.map(|(msg_id, read_ct, enqueued_at, message)| Delivery {
            msg_id,
            read_ct,
            enqueued_at,
            message,
        });

        self.count(if delivery.is_some() {
            "read"
        } else {
            "read_empty"
        });

        Ok(delivery)
    }

    /// Archive rather than delete, so dispatched invocations stay auditable.
    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&self.name)
            .bind(delivery.msg_id)
            .execute(self.db.pool())
            .await?;
        self.count("archive");
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(&self.name)
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.0.max(0) as usize)
    }
}
