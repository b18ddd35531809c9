//! Cache maintenance: purge expired rows from the Postgres cache table.
//!
//! Expired rows are already invisible to reads; purging only reclaims space.
//! The run is claimed per hourly bucket so overlapping schedulers trigger it
//! at most once an hour.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::info;

use crate::db::Db;
use crate::engine::{StepContext, StepHandler, StepPolicy, WorkflowEngine, WorkflowRegistry};
use crate::error::Result;
use crate::model::{StepOutcome, WorkflowInvocation};

pub const WORKFLOW: &str = "maintenance";
pub const PURGE_STEP: &str = "purge_expired";

const BUCKET_TTL_SECONDS: u64 = 3_600;

pub struct PurgeExpired {
    db: Arc<Db>,
}

#[async_trait]
impl StepHandler for PurgeExpired {
    async fn run(&self, ctx: StepContext, params: Value) -> Result<StepOutcome> {
        let db = &self.db;
        let removed = ctx
            .coord
            .retry()
            .run(move || db.purge_expired(), "maintenance.purge_expired", 3)
            .await?;
        info!(removed, bucket = %params["bucket"], "expired cache rows purged");
        Ok(StepOutcome::Terminal)
    }
}

pub fn register(registry: &mut WorkflowRegistry, db: Arc<Db>) -> Result<()> {
    registry.register(
        WORKFLOW,
        PURGE_STEP,
        StepPolicy::default().claim_field("bucket", BUCKET_TTL_SECONDS),
        PurgeExpired { db },
    )
}

/// Hour bucket used as the claim target, e.g. `2026-10-17T13`.
pub fn bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

/// Enqueue a purge for the current hour.
pub async fn start(engine: &WorkflowEngine) -> Result<WorkflowInvocation> {
    let now = engine.coordination().clock.now();
    engine
        .start_workflow(WORKFLOW, PURGE_STEP, json!({ "bucket": bucket(now) }))
        .await
}
