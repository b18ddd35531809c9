//! Metric instrument factories for docflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"docflow"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for docflow instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("docflow")
}

/// Counter: mutex acquisition attempts that finished.
/// Labels: `label`, `result` ("acquired" | "timeout").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("docflow.lock.acquisitions")
        .with_description("Lease acquisitions by outcome")
        .build()
}

/// Counter: idempotency claims.
/// Labels: `result` ("claimed" | "duplicate" | "contended").
pub fn claim_attempts() -> Counter<u64> {
    meter()
        .u64_counter("docflow.claim.attempts")
        .with_description("Idempotency claim attempts by outcome")
        .build()
}

/// Counter: dispatched invocations.
/// Labels: `workflow`, `outcome`.
pub fn dispatch_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("docflow.dispatch.outcomes")
        .with_description("Dispatched invocations by outcome")
        .build()
}

/// Counter: invocations enqueued.
/// Labels: `workflow`, `step`.
pub fn invocations_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("docflow.invocations.enqueued")
        .with_description("Workflow invocations enqueued")
        .build()
}

/// Counter: failed attempts inside RetryWithBackoff.
/// Labels: `label`.
pub fn retry_failures() -> Counter<u64> {
    meter()
        .u64_counter("docflow.retry.failures")
        .with_description("Failed attempts of retried operations")
        .build()
}

/// Counter: stale state found expired and treated as absent.
/// Labels: `kind`.
pub fn state_recovered() -> Counter<u64> {
    meter()
        .u64_counter("docflow.state.recovered")
        .with_description("Stale coordination state recovered")
        .build()
}

/// Counter: queue-level operations (send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("docflow.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: expired rows purged from the store.
/// Labels: `table`.
pub fn store_purged() -> Counter<u64> {
    meter()
        .u64_counter("docflow.store.purged")
        .with_description("Expired cache rows removed")
        .build()
}

/// Histogram: step handler duration in milliseconds.
/// Labels: `workflow`, `step`.
pub fn step_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("docflow.step.duration_ms")
        .with_description("Step handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
