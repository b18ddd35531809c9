//! Core data model.
//!
//! A workflow invocation is one queued step of a named workflow. The
//! coordination records (leases, claims, reentrancy flags, debounce and
//! rate counters) are what the primitives persist to the stores between
//! invocations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Invocation
// ---------------------------------------------------------------------------

/// One unit of queued work: run `step` of `workflow` with `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInvocation {
    pub id: InvocationId,

    pub workflow: String,

    pub step: String,

    /// Forwarded verbatim to the step handler. The engine doesn't interpret these.
    pub params: serde_json::Value,

    /// Who enqueued this (e.g. "edit-trigger", "flowA/step1").
    pub queued_by: String,

    /// Higher = more urgent. Only the in-memory queue honors it.
    pub priority: i32,

    /// The invocation whose completion enqueued this one.
    pub parent_id: Option<InvocationId>,

    pub enqueued_at: DateTime<Utc>,
}

/// Newtype for invocation IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Entrypoint message
// ---------------------------------------------------------------------------

/// Input accepted by the generic dispatch entrypoint.
///
/// Wire form: `{"type":"RUN_STEP","workflowName":..,"stepName":..,"params":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DispatchMessage {
    #[serde(rename = "RUN_STEP", rename_all = "camelCase")]
    RunStep {
        workflow_name: String,
        step_name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Step Outcome
// ---------------------------------------------------------------------------

/// What a step handler asks the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The run is finished.
    Terminal,
    /// Enqueue exactly one successor step of the same workflow.
    Next {
        step: String,
        params: serde_json::Value,
    },
}

impl StepOutcome {
    pub fn next(step: impl Into<String>, params: serde_json::Value) -> Self {
        StepOutcome::Next {
            step: step.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordination records
// ---------------------------------------------------------------------------

/// Proof of lock ownership. The holder owns the lock only while the stored
/// value at `key` still equals `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub key: String,
    pub token: String,
    pub lease_seconds: u64,
}

/// Sentinel marking a (workflow, step, target) as already started.
/// Removed only by TTL expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimKey {
    pub key: String,
    pub ttl_seconds: u64,
}

impl ClaimKey {
    pub fn for_step(workflow: &str, step: &str, target: &str, ttl_seconds: u64) -> Self {
        Self {
            key: format!("claim:{workflow}:{step}:{target}"),
            ttl_seconds,
        }
    }
}

/// Durable "programmatic edit in progress" counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReentrancyFlag {
    pub count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Last trigger seen for a debounce domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceRecord {
    pub last_timestamp: DateTime<Utc>,
    pub discriminator: String,
}

/// Calls counted in the current rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new invocations. The engine's public API for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewInvocation {
    pub(crate) workflow: String,
    pub(crate) step: String,
    pub(crate) params: serde_json::Value,
    pub(crate) queued_by: String,
    pub(crate) priority: i32,
    pub(crate) parent_id: Option<InvocationId>,
}

impl NewInvocation {
    pub fn new(workflow: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            step: step.into(),
            params: serde_json::Value::Null,
            queued_by: "api".to_string(),
            priority: 0,
            parent_id: None,
        }
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn queued_by(mut self, source: impl Into<String>) -> Self {
        self.queued_by = source.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent_id: InvocationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn build(self, now: DateTime<Utc>) -> WorkflowInvocation {
        WorkflowInvocation {
            id: InvocationId::new(),
            workflow: self.workflow,
            step: self.step,
            params: self.params,
            queued_by: self.queued_by,
            priority: self.priority,
            parent_id: self.parent_id,
            enqueued_at: now,
        }
    }
}

impl From<DispatchMessage> for NewInvocation {
    fn from(msg: DispatchMessage) -> Self {
        match msg {
            DispatchMessage::RunStep {
                workflow_name,
                step_name,
                params,
            } => NewInvocation::new(workflow_name, step_name)
                .params(params)
                .queued_by("host"),
        }
    }
}
