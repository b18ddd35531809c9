//! Dispatcher: the single generic entrypoint that runs queued steps.
//!
//! Each dispatch rebuilds the registry, runs one step (behind its claim,
//! lock and reentrancy policy), and either finishes the run or enqueues
//! exactly one successor. Handler failures are caught here and logged;
//! nothing is retried automatically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::registry::RegisteredStep;
use super::step::StepContext;
use super::workflow::WorkflowEngine;
use crate::error::{Error, Result};
use crate::model::{
    ClaimKey, DispatchMessage, InvocationId, NewInvocation, StepOutcome, WorkflowInvocation,
};
use crate::telemetry::metrics;
use crate::telemetry::step::{record_outcome, start_step_span};

/// What a single dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReport {
    /// Queue was empty.
    Idle,
    /// Step ran and ended the run.
    Completed,
    /// Step ran and enqueued its successor.
    Advanced { next: InvocationId },
    /// Step was already claimed within its TTL; nothing ran.
    Duplicate,
    /// Step failed (or could not be started); the run stops here.
    Halted { error: String },
    /// Invocation was malformed and discarded without running.
    Dropped { reason: String },
}

impl DispatchReport {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchReport::Idle => "idle",
            DispatchReport::Completed => "completed",
            DispatchReport::Advanced { .. } => "advanced",
            DispatchReport::Duplicate => "duplicate",
            DispatchReport::Halted { .. } => "halted",
            DispatchReport::Dropped { .. } => "dropped",
        }
    }
}

enum StepRun {
    Duplicate,
    Ran(StepOutcome),
}

/// Pulls invocations off the queue and runs them.
#[derive(Clone)]
pub struct Dispatcher {
    engine: WorkflowEngine,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(engine: WorkflowEngine) -> Self {
        let poll_interval = engine.coordination().config.poll_interval;
        Self {
            engine,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Signal [`Dispatcher::run`] to return.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Poll the queue until shutdown, draining it on every wake-up.
    pub async fn run(&self) -> Result<()> {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "dispatcher started");

        loop {
            loop {
                match self.dispatch_next().await {
                    Ok(DispatchReport::Idle) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("dispatch_next error: {e}");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Receive, run and ack at most one queued invocation.
    ///
    /// Only queue failures surface as `Err`; every step-level problem is
    /// reported in the [`DispatchReport`] and the message is acked, so a
    /// bad message is never redelivered.
    pub async fn dispatch_next(&self) -> Result<DispatchReport> {
        let queue = self.engine.queue();
        let Some(delivery) = queue.receive().await? else {
            return Ok(DispatchReport::Idle);
        };
        if delivery.read_ct > 1 {
            warn!(
                msg_id = delivery.msg_id,
                read_ct = delivery.read_ct,
                enqueued_at = %delivery.enqueued_at,
                "message redelivered after an unacked dispatch"
            );
        }

        let report = match serde_json::from_value::<WorkflowInvocation>(delivery.message.clone()) {
            Ok(invocation) => self.dispatch(invocation).await,
            Err(e) => {
                warn!(msg_id = delivery.msg_id, error = %e, "unparsable queue payload, dropping");
                let report = DispatchReport::Dropped {
                    reason: format!("bad payload: {e}"),
                };
                self.count("unknown", &report);
                report
            }
        };

        queue.ack(&delivery).await?;
        Ok(report)
    }

    /// Host entrypoint: run a `{"type":"RUN_STEP", ...}` message directly.
    pub async fn dispatch_message(&self, message: Value) -> DispatchReport {
        match serde_json::from_value::<DispatchMessage>(message) {
            Ok(msg) => {
                let invocation = NewInvocation::from(msg).build(self.engine.coordination().clock.now());
                self.dispatch(invocation).await
            }
            Err(e) => {
                warn!(error = %e, "unrecognized dispatch message, dropping");
                DispatchReport::Dropped {
                    reason: format!("bad message: {e}"),
                }
            }
        }
    }

    /// Run one invocation to a report. Never fails.
    pub async fn dispatch(&self, invocation: WorkflowInvocation) -> DispatchReport {
        let span = start_step_span(&invocation);
        let report = self.dispatch_inner(&invocation).instrument(span.clone()).await;
        record_outcome(&span, report.as_str());
        self.count(&invocation.workflow, &report);
        report
    }

    async fn dispatch_inner(&self, inv: &WorkflowInvocation) -> DispatchReport {
        let registry = match self.engine.register_all_workflows() {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "workflow registration failed");
                return DispatchReport::Halted {
                    error: e.to_string(),
                };
            }
        };

        let step = match registry.resolve(&inv.workflow, &inv.step) {
            Ok(step) => step,
            Err(e) => {
                warn!(
                    workflow = %inv.workflow,
                    step = %inv.step,
                    params = %inv.params,
                    "malformed invocation dropped: {e}"
                );
                return DispatchReport::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        let claim = match &step.policy.claim {
            Some(policy) => match policy.target.discriminator(&inv.params) {
                Ok(target) => Some(ClaimKey::for_step(
                    &inv.workflow,
                    &inv.step,
                    &target,
                    policy
                        .ttl_seconds
                        .unwrap_or(self.engine.coordination().config.claim_ttl_seconds),
                )),
                Err(e) => {
                    let e = Error::MalformedInvocation {
                        workflow: inv.workflow.clone(),
                        step: inv.step.clone(),
                        reason: e.to_string(),
                    };
                    warn!(params = %inv.params, "malformed invocation dropped: {e}");
                    return DispatchReport::Dropped {
                        reason: e.to_string(),
                    };
                }
            },
            None => None,
        };

        let started = Instant::now();
        let result = self.run_step(step, inv, claim.as_ref()).await;
        if !matches!(result, Ok(StepRun::Duplicate)) {
            metrics::step_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("workflow", inv.workflow.clone()),
                    KeyValue::new("step", inv.step.clone()),
                ],
            );
        }

        match result {
            Ok(StepRun::Duplicate) => DispatchReport::Duplicate,
            Ok(StepRun::Ran(StepOutcome::Terminal)) => {
                info!(id = %inv.id, "workflow run completed");
                DispatchReport::Completed
            }
            Ok(StepRun::Ran(StepOutcome::Next { step, params })) => {
                let next = NewInvocation::new(&inv.workflow, step)
                    .params(params)
                    .queued_by(format!("{}/{}", inv.workflow, inv.step))
                    .priority(inv.priority)
                    .parent(inv.id);
                match self.engine.enqueue_with(&registry, next).await {
                    Ok(next) => DispatchReport::Advanced { next: next.id },
                    Err(e) => {
                        error!(
                            workflow = %inv.workflow,
                            step = %inv.step,
                            error = %e,
                            "successor not enqueued, run halted"
                        );
                        DispatchReport::Halted {
                            error: e.to_string(),
                        }
                    }
                }
            }
            Err(e) => {
                error!(
                    id = %inv.id,
                    workflow = %inv.workflow,
                    step = %inv.step,
                    params = %inv.params,
                    queued_by = %inv.queued_by,
                    error = %e,
                    "step failed, run halted"
                );
                DispatchReport::Halted {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Take the step's lock, then its claim, then invoke the handler inside
    /// its reentrancy guard. The claim is only written once the lock is held,
    /// so a lock timeout leaves the step free to run on the next trigger.
    async fn run_step(
        &self,
        step: &RegisteredStep,
        inv: &WorkflowInvocation,
        claim: Option<&ClaimKey>,
    ) -> Result<StepRun> {
        let coord = self.engine.coordination();
        let label = format!("{}/{}", inv.workflow, inv.step);
        let label = &label;

        let body = move || async move {
            if let Some(key) = claim {
                if !coord.claims().claim_key(key).await? {
                    info!(key = %key.key, "step already claimed, skipping");
                    return Ok(StepRun::Duplicate);
                }
            }

            let ctx = StepContext {
                invocation: inv.clone(),
                coord: coord.clone(),
            };
            let outcome = if step.policy.guarded {
                coord
                    .reentrancy()
                    .run_guarded(label, || step.handler.run(ctx, inv.params.clone()))
                    .await?
            } else {
                step.handler.run(ctx, inv.params.clone()).await?
            };
            Ok(StepRun::Ran(outcome))
        };

        match &step.policy.lock {
            Some(lock) => {
                let config = &coord.config;
                let timeout_ms = lock.timeout_ms.unwrap_or_else(|| {
                    u64::try_from(config.lock_timeout.as_millis()).unwrap_or(u64::MAX)
                });
                let lease_seconds = lock.lease_seconds.unwrap_or(config.lease_seconds);
                coord
                    .mutex()
                    .label(label.as_str())
                    .acquire(&lock.resource, timeout_ms, lease_seconds, body)
                    .await
            }
            None => body().await,
        }
    }

    fn count(&self, workflow: &str, report: &DispatchReport) {
        metrics::dispatch_outcomes().add(
            1,
            &[
                KeyValue::new("workflow", workflow.to_string()),
                KeyValue::new("outcome", report.as_str()),
            ],
        );
    }
}
