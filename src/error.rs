//! Error types for docflow.
//!
//! Low-level primitives (claims, debounce, rate limits) report contention
//! through `bool`/`Option` returns. Only the mutex timeout, step failures,
//! malformed invocations and backend faults surface as `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Lock (or brief internal lock) not obtained before the deadline.
    #[error("timed out acquiring {resource} ({label})")]
    AcquisitionTimeout { resource: String, label: String },

    /// A step handler failed. The run halts at this step.
    #[error("step {workflow}/{step} failed: {message}")]
    StepExecution {
        workflow: String,
        step: String,
        message: String,
    },

    /// Invocation names an unregistered (workflow, step) pair or cannot be parsed.
    #[error("malformed invocation {workflow}/{step}: {reason}")]
    MalformedInvocation {
        workflow: String,
        step: String,
        reason: String,
    },

    #[error("{label} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        last_error: Box<Error>,
    },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand used by step handlers to report a failure.
    pub fn step(workflow: &str, step: &str, message: impl Into<String>) -> Self {
        Error::StepExecution {
            workflow: workflow.to_string(),
            step: step.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
