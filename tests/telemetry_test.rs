//! Integration tests for telemetry initialization and span helpers.

use chrono::Utc;
use docflow::model::{InvocationId, WorkflowInvocation};
use docflow::telemetry::{TelemetryConfig, init_telemetry, step};
use serde_json::json;

#[test]
fn telemetry_initializes_without_endpoint() {
    // The global subscriber can only be set once per process; a second
    // init in the same process returns Err, which is fine here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "docflow-test".to_string(),
        default_filter: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn step_span_records_outcome() {
    let invocation = WorkflowInvocation {
        id: InvocationId::new(),
        workflow: "flowA".to_string(),
        step: "step1".to_string(),
        params: json!({"doc": "ledger"}),
        queued_by: "api".to_string(),
        priority: 0,
        parent_id: None,
        enqueued_at: Utc::now(),
    };
    let span = step::start_step_span(&invocation);
    step::record_outcome(&span, "completed");
}
