//! Test helpers and utilities shared by the in-crate test modules.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use crate::bus::{Event, EventBatch, EventType, RawEvent};
use crate::error::ListenerError;


#[cfg(test)]
mod batching;

/// Fixed base instant so ordering assertions are deterministic.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn event_at(id: &str, session: &str, offset_ms: i64) -> Event {
    Event::new(
        id,
        session,
        EventType::PostToolUse,
        base_time() + Duration::milliseconds(offset_ms),
    )
}

pub fn raw_event(id: &str, session: &str, kind: &str) -> RawEvent {
    RawEvent {
        id: Some(id.to_string()),
        session_id: Some(session.to_string()),
        event_type: Some(kind.to_string()),
        timestamp: Some(json!(base_time().to_rfc3339())),
        metadata: Some(json!({"tool_name": "bash", "tool_input": {"command": "ls"}})),
    }
}

/// Listener that records every batch it sees.
pub fn recorder() -> (
    Arc<Mutex<Vec<EventBatch>>>,
    impl Fn(&EventBatch) -> Result<(), ListenerError> + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = move |batch: &EventBatch| {
        sink.lock().unwrap().push(batch.clone());
        Ok(())
    };
    (seen, listener)
}

pub fn ids(batch: &EventBatch) -> Vec<String> {
    batch.events.iter().map(|e| e.id.clone()).collect()
}
