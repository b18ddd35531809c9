//! Registration table of `(workflow, step) -> handler`.
//!
//! The registry is rebuilt from a [`WorkflowCatalog`] at the start of every
//! dispatch; nothing about it is persisted or assumed to survive between
//! invocations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::step::{FnHandler, StepContext, StepHandler, StepPolicy};
use crate::error::{Error, Result};
use crate::model::StepOutcome;

/// A handler together with the policy it is dispatched under.
#[derive(Clone)]
pub struct RegisteredStep {
    pub handler: Arc<dyn StepHandler>,
    pub policy: StepPolicy,
}

#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    steps: BTreeMap<(String, String), RegisteredStep>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a step. Registering the same pair twice
    /// replaces the earlier entry, so catalogs can run repeatedly.
    pub fn register(
        &mut self,
        workflow: &str,
        step: &str,
        policy: StepPolicy,
        handler: impl StepHandler + 'static,
    ) -> Result<()> {
        validate_name("workflow", workflow)?;
        validate_name("step", step)?;
        if policy.claim.as_ref().is_some_and(|c| c.ttl_seconds == Some(0)) {
            return Err(Error::InvalidRegistration(format!(
                "{workflow}/{step}: claim TTL must be positive"
            )));
        }
        if policy
            .lock
            .as_ref()
            .is_some_and(|l| l.resource.trim().is_empty())
        {
            return Err(Error::InvalidRegistration(format!(
                "{workflow}/{step}: lock resource is empty"
            )));
        }

        self.steps.insert(
            (workflow.to_string(), step.to_string()),
            RegisteredStep {
                handler: Arc::new(handler),
                policy,
            },
        );
        Ok(())
    }

    /// Register an async closure as a step.
    pub fn register_fn<F, Fut>(
        &mut self,
        workflow: &str,
        step: &str,
        policy: StepPolicy,
        f: F,
    ) -> Result<()>
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.register(workflow, step, policy, FnHandler(f))
    }

    pub fn get(&self, workflow: &str, step: &str) -> Option<&RegisteredStep> {
        self.steps.get(&(workflow.to_string(), step.to_string()))
    }

    /// Look up a step, failing with [`Error::MalformedInvocation`] if unknown.
    pub fn resolve(&self, workflow: &str, step: &str) -> Result<&RegisteredStep> {
        self.get(workflow, step)
            .ok_or_else(|| Error::MalformedInvocation {
                workflow: workflow.to_string(),
                step: step.to_string(),
                reason: "no handler registered".to_string(),
            })
    }

    pub fn contains(&self, workflow: &str, step: &str) -> bool {
        self.get(workflow, step).is_some()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Registered `(workflow, step)` pairs in sorted order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.steps.keys().map(|(w, s)| (w.as_str(), s.as_str()))
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidRegistration(format!("{kind} name is empty")));
    }
    // ':' delimits claim and lock keys.
    if name.contains(':') {
        return Err(Error::InvalidRegistration(format!(
            "{kind} name '{name}' must not contain ':'"
        )));
    }
    Ok(())
}

/// Source of all workflow registrations.
pub trait WorkflowCatalog: Send + Sync {
    fn register_all(&self, registry: &mut WorkflowRegistry) -> Result<()>;
}

impl<F> WorkflowCatalog for F
where
    F: Fn(&mut WorkflowRegistry) -> Result<()> + Send + Sync,
{
    fn register_all(&self, registry: &mut WorkflowRegistry) -> Result<()> {
        self(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn done(_ctx: StepContext, _params: Value) -> Result<StepOutcome> {
        Ok(StepOutcome::Terminal)
    }

    #[test]
    fn rejects_bad_names() {
        let mut registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.register_fn("", "step", StepPolicy::default(), done),
            Err(Error::InvalidRegistration(_))
        ));
        assert!(matches!(
            registry.register_fn("flow:a", "step", StepPolicy::default(), done),
            Err(Error::InvalidRegistration(_))
        ));
        assert!(
            registry
                .register_fn("flow", "step", StepPolicy::default().claim_field("row", 0), done)
                .is_err()
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistration_is_idempotent() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register_fn("flowA", "step1", StepPolicy::default(), done)
            .unwrap();
        registry
            .register_fn("flowA", "step1", StepPolicy::default().guarded(), done)
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("flowA", "step1").unwrap().policy.guarded);
    }

    #[test]
    fn resolve_unknown_pair_is_malformed() {
        let registry = WorkflowRegistry::new();
        match registry.resolve("flowA", "missing") {
            Err(Error::MalformedInvocation { workflow, step, .. }) => {
                assert_eq!(workflow, "flowA");
                assert_eq!(step, "missing");
            }
            _ => panic!("expected MalformedInvocation"),
        }
    }

    #[test]
    fn closures_act_as_catalogs() {
        let catalog = |registry: &mut WorkflowRegistry| {
            registry.register_fn("flowA", "step1", StepPolicy::default(), done)?;
            registry.register_fn("flowA", "step2", StepPolicy::default(), done)
        };
        let mut registry = WorkflowRegistry::new();
        catalog.register_all(&mut registry).unwrap();
        let pairs: Vec<_> = registry.pairs().collect();
        assert_eq!(pairs, vec![("flowA", "step1"), ("flowA", "step2")]);
    }
}
