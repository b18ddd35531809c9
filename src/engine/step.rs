//! Step handlers and the per-step execution policy.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::coord::Coordination;
use crate::error::{Error, Result};
use crate::model::{StepOutcome, WorkflowInvocation};

/// What a handler sees besides its params.
#[derive(Clone)]
pub struct StepContext {
    pub invocation: WorkflowInvocation,
    pub coord: Coordination,
}

impl StepContext {
    pub fn workflow(&self) -> &str {
        &self.invocation.workflow
    }

    pub fn step(&self) -> &str {
        &self.invocation.step
    }

    /// Build a step failure carrying this step's identity.
    pub fn fail(&self, message: impl Into<String>) -> Error {
        Error::step(self.workflow(), self.step(), message)
    }
}

/// One registered step of a workflow.
///
/// Handlers must be idempotent at the data level: claims narrow duplicate
/// dispatch but do not rule it out across crashes.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: StepContext, params: Value) -> Result<StepOutcome>;
}

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
{
    async fn run(&self, ctx: StepContext, params: Value) -> Result<StepOutcome> {
        (self.0)(ctx, params).await
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Which part of the params distinguishes one unit of work from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTarget {
    /// The whole params object, serialized with sorted keys.
    Params,
    /// A single top-level field.
    Field(String),
}

impl ClaimTarget {
    pub fn discriminator(&self, params: &Value) -> Result<String> {
        match self {
            ClaimTarget::Params => Ok(serde_json::to_string(params)?),
            ClaimTarget::Field(name) => match params.get(name) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Null) | None => Err(Error::Other(format!(
                    "claim target field '{name}' missing from params"
                ))),
                Some(other) => Ok(other.to_string()),
            },
        }
    }
}

/// `None` fields fall back to the [`CoordinationConfig`] in effect at dispatch.
///
/// [`CoordinationConfig`]: crate::config::CoordinationConfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub target: ClaimTarget,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    pub resource: String,
    pub timeout_ms: Option<u64>,
    pub lease_seconds: Option<u64>,
}

/// How the dispatcher wraps a step handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPolicy {
    /// Skip the step if the same target was claimed within the TTL.
    pub claim: Option<ClaimPolicy>,
    /// Hold this mutex while the handler runs. The claim is taken inside it.
    pub lock: Option<LockPolicy>,
    /// Mark the run as a programmatic edit.
    pub guarded: bool,
}

impl StepPolicy {
    pub fn claim(mut self, target: ClaimTarget, ttl_seconds: u64) -> Self {
        self.claim = Some(ClaimPolicy {
            target,
            ttl_seconds: Some(ttl_seconds),
        });
        self
    }

    pub fn claim_field(self, field: impl Into<String>, ttl_seconds: u64) -> Self {
        self.claim(ClaimTarget::Field(field.into()), ttl_seconds)
    }

    /// Claim on `field` for the configured claim TTL.
    pub fn claim_on(mut self, field: impl Into<String>) -> Self {
        self.claim = Some(ClaimPolicy {
            target: ClaimTarget::Field(field.into()),
            ttl_seconds: None,
        });
        self
    }

    pub fn lock(mut self, resource: impl Into<String>, timeout_ms: u64, lease_seconds: u64) -> Self {
        self.lock = Some(LockPolicy {
            resource: resource.into(),
            timeout_ms: Some(timeout_ms),
            lease_seconds: Some(lease_seconds),
        });
        self
    }

    /// Lock `resource` with the configured timeout and lease.
    pub fn lock_on(mut self, resource: impl Into<String>) -> Self {
        self.lock = Some(LockPolicy {
            resource: resource.into(),
            timeout_ms: None,
            lease_seconds: None,
        });
        self
    }

    pub fn guarded(mut self) -> Self {
        self.guarded = true;
        self
    }
}
