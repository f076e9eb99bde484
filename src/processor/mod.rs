//! Event processing: raw input to canonical [`Event`]s.
//!
//! - `validate`: structural checks and timestamp resolution
//! - `sanitize`: deep redaction of sensitive payload fields
//! - `micro_batch`: a standalone delay/size batching helper
//!
//! The processor never fails loudly. Bad input is dropped and counted in
//! [`ProcessorMetrics::error_count`].

mod micro_batch;
mod sanitize;
mod validate;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::bus::{Event, EventType, RawEvent};

pub use micro_batch::{batch_events, BatchOptions, MicroBatcher};
pub use sanitize::{
    is_sensitive_key, redact_secrets, sanitize, Sanitizer, DEFAULT_MAX_DEPTH, DEPTH_EXCEEDED,
    REDACTED, SENSITIVE_KEY_FRAGMENTS,
};
pub use validate::{parse_timestamp, validate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorMetrics {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Default)]
pub struct EventProcessor {
    sanitizer: Sanitizer,
    total_processed: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sanitizer(sanitizer: Sanitizer) -> Self {
        Self {
            sanitizer,
            ..Self::default()
        }
    }

    pub fn validate(&self, raw: &RawEvent) -> bool {
        validate(raw)
    }

    pub fn sanitize(&self, value: &Value) -> Value {
        self.sanitizer.sanitize(value)
    }

    /// Validate, sanitize and normalize one raw event.
    ///
    /// Returns `None` for invalid input; the failure only shows up in metrics.
    pub fn process(&self, raw: &RawEvent) -> Option<Event> {
        let Some(event) = self.build(raw) else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = ?raw.id, "dropping invalid raw event");
            return None;
        };
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Process each item independently, keeping only the successes.
    pub fn process_batch(&self, raws: &[RawEvent]) -> Vec<Event> {
        raws.iter().filter_map(|raw| self.process(raw)).collect()
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        ProcessorMetrics {
            total_processed: self.total_processed.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    pub fn reset_metrics(&self) {
        self.total_processed.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
    }

    fn build(&self, raw: &RawEvent) -> Option<Event> {
        if !validate(raw) {
            return None;
        }
        let id = raw.id.as_deref()?.trim().to_string();
        let session_id = raw.session_id.as_deref()?.trim().to_string();
        let event_type = raw.event_type.as_deref()?.parse::<EventType>().ok()?;
        let timestamp = raw.timestamp.as_ref().and_then(parse_timestamp)?;
        let metadata = match &raw.metadata {
            None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
            Some(value @ Value::Object(_)) => self.sanitizer.sanitize(value),
            Some(other) => {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert("value".to_string(), other.clone());
                self.sanitizer.sanitize(&Value::Object(wrapped))
            }
        };
        Some(Event {
            id,
            session_id,
            event_type,
            timestamp,
            metadata,
        })
    }
}

/// Partition events by session, keeping arrival order inside each group.
pub fn group_events_by_session(events: &[Event]) -> HashMap<String, Vec<Event>> {
    let mut groups: HashMap<String, Vec<Event>> = HashMap::new();
    for event in events {
        groups
            .entry(event.session_id.clone())
            .or_default()
            .push(event.clone());
    }
    groups
}

/// Drop repeated ids. The first occurrence wins even if later payloads differ.
pub fn deduplicate_events(events: &[Event]) -> Vec<Event> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(events.len());
    events
        .iter()
        .filter(|event| seen.insert(event.id.as_str()))
        .cloned()
        .collect()
}
