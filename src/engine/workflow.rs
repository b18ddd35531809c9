//! Workflow start/advance API used by feature handlers.
//!
//! Feature handlers call [`WorkflowEngine::start_workflow`] (or
//! [`WorkflowEngine::enqueue`]) and return. There is no completion signal;
//! the dispatcher picks the invocation up in a later, separate invocation.

use std::sync::Arc;

use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::info;

use super::registry::{WorkflowCatalog, WorkflowRegistry};
use crate::coord::Coordination;
use crate::error::Result;
use crate::model::{NewInvocation, WorkflowInvocation};
use crate::queue::InvocationQueue;
use crate::telemetry::metrics;

/// Owns the queue, the shared stores and the workflow catalog.
#[derive(Clone)]
pub struct WorkflowEngine {
    queue: Arc<dyn InvocationQueue>,
    coord: Coordination,
    catalog: Arc<dyn WorkflowCatalog>,
}

impl WorkflowEngine {
    pub fn new(
        queue: Arc<dyn InvocationQueue>,
        coord: Coordination,
        catalog: Arc<dyn WorkflowCatalog>,
    ) -> Self {
        Self {
            queue,
            coord,
            catalog,
        }
    }

    pub fn queue(&self) -> &Arc<dyn InvocationQueue> {
        &self.queue
    }

    pub fn coordination(&self) -> &Coordination {
        &self.coord
    }

    /// Build a fresh registry from the catalog.
    ///
    /// Called at the start of every dispatch and before every enqueue;
    /// registration is idempotent so repeating it is harmless.
    pub fn register_all_workflows(&self) -> Result<WorkflowRegistry> {
        let mut registry = WorkflowRegistry::new();
        self.catalog.register_all(&mut registry)?;
        Ok(registry)
    }

    /// Enqueue the first step of a workflow run.
    pub async fn start_workflow(
        &self,
        workflow: &str,
        first_step: &str,
        params: Value,
    ) -> Result<WorkflowInvocation> {
        self.enqueue(NewInvocation::new(workflow, first_step).params(params))
            .await
    }

    /// Enqueue any step. Refuses pairs the catalog does not register.
    pub async fn enqueue(&self, new: NewInvocation) -> Result<WorkflowInvocation> {
        let registry = self.register_all_workflows()?;
        self.enqueue_with(&registry, new).await
    }

    pub(crate) async fn enqueue_with(
        &self,
        registry: &WorkflowRegistry,
        new: NewInvocation,
    ) -> Result<WorkflowInvocation> {
        registry.resolve(&new.workflow, &new.step)?;

        let invocation = new.build(self.coord.clock.now());
        let msg_id = self.queue.enqueue(&invocation).await?;

        info!(
            id = %invocation.id,
            msg_id,
            workflow = %invocation.workflow,
            step = %invocation.step,
            queued_by = %invocation.queued_by,
            "invocation enqueued"
        );
        metrics::invocations_enqueued().add(
            1,
            &[
                KeyValue::new("workflow", invocation.workflow.clone()),
                KeyValue::new("step", invocation.step.clone()),
            ],
        );
        Ok(invocation)
    }
}
