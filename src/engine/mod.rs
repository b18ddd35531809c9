//! Workflow engine: step registry, start/enqueue API, and the dispatcher.
//!
//! A workflow is a chain of named steps. Each dispatched step either ends
//! the run or enqueues exactly one successor; steps never loop in-process,
//! because a single invocation cannot outlive the host's time ceiling.

pub mod dispatch;
pub mod registry;
pub mod step;
pub mod workflow;

pub use dispatch::{DispatchReport, Dispatcher};
pub use registry::{RegisteredStep, WorkflowCatalog, WorkflowRegistry};
pub use step::{ClaimPolicy, ClaimTarget, FnHandler, LockPolicy, StepContext, StepHandler, StepPolicy};
pub use workflow::WorkflowEngine;
