//! # docflow
//!
//! Workflow and concurrency coordination for an edit-driven shared document.
//!
//! Every unit of work runs in its own short-lived invocation, and
//! invocations may overlap against the same document. This crate provides the
//! pieces that keep them from stepping on each other: a durable step queue
//! with a generic dispatcher, a lease-based mutex, idempotency claims, a
//! reentrancy flag, debouncing, rate limiting and retry with backoff, all
//! built on an injected TTL cache and a durable property store.

pub mod clock;
pub mod config;
pub mod coord;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod workflows;
