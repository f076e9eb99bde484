// tests/common/mod.rs
//! Common test utilities for pipeline integration tests.

use serde_json::{json, Value};
use session_telemetry::EventBatch;

/// One NDJSON line for a hook event.
pub fn hook_line(id: &str, session: &str, kind: &str, timestamp: &str, metadata: Value) -> String {
    json!({
        "id": id,
        "session_id": session,
        "event_type": kind,
        "timestamp": timestamp,
        "metadata": metadata,
    })
    .to_string()
}

/// Parse every batch written by the pipeline.
pub fn parse_batches(output: &[u8]) -> Vec<EventBatch> {
    String::from_utf8_lossy(output)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("pipeline wrote invalid batch json"))
        .collect()
}
