//! Event, batch and flush-reason types plus the priority flush policy.
//!
//! Single source of truth for the hook event kinds a monitored session can
//! emit and for which of them bypass the accumulation window.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The hook points a monitored agent session reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Notification,
    Stop,
    SubagentStop,
    PreCompact,
    Error,
}

impl EventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::UserPromptSubmit => "user_prompt_submit",
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::Notification => "notification",
            Self::Stop => "stop",
            Self::SubagentStop => "subagent_stop",
            Self::PreCompact => "pre_compact",
            Self::Error => "error",
        }
    }

    pub const fn all() -> &'static [EventType] {
        &[
            EventType::SessionStart,
            EventType::UserPromptSubmit,
            EventType::PreToolUse,
            EventType::PostToolUse,
            EventType::Notification,
            EventType::Stop,
            EventType::SubagentStop,
            EventType::PreCompact,
            EventType::Error,
        ]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    /// Accepts the snake_case wire names and the PascalCase hook names
    /// (`PreToolUse`) emitted by some hook scripts.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "sessionstart" => Ok(Self::SessionStart),
            "userpromptsubmit" => Ok(Self::UserPromptSubmit),
            "pretooluse" => Ok(Self::PreToolUse),
            "posttooluse" => Ok(Self::PostToolUse),
            "notification" => Ok(Self::Notification),
            "stop" => Ok(Self::Stop),
            "subagentstop" => Ok(Self::SubagentStop),
            "precompact" => Ok(Self::PreCompact),
            "error" => Ok(Self::Error),
            _ => Err(format!("unsupported event type: {value}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// An event as it arrives from the transport, before validation.
///
/// Every field is optional so that malformed input still deserializes and
/// can be rejected (and counted) by the processor instead of failing at the
/// serde boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "type", alias = "eventType")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// A validated, sanitized telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            event_type,
            timestamp,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Structural check applied by the batcher to already-typed events.
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty() && !self.session_id.trim().is_empty()
    }
}

/// Why a batch was cut.
///
/// Diagnostic only; consumers must not rely on it for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushReason {
    Size,
    Timeout,
    Manual,
    Burst,
    Priority,
}

impl FlushReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Manual => "manual",
            Self::Burst => "burst",
            Self::Priority => "priority",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A delivery unit handed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: String,
    pub events: Vec<Event>,
    pub flushed_at: DateTime<Utc>,
    pub reason: FlushReason,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Flush policy
// ---------------------------------------------------------------------------

/// Returns true if this event should be delivered without waiting for the
/// window. The current buffer is flushed together with it so ordering holds.
pub fn should_flush_immediately(event: &Event, priority_types: &[EventType]) -> bool {
    priority_types.contains(&event.event_type)
}
