//! Event and session data contracts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of instrumentation record emitted by the monitored agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Notification,
    Stop,
    SubagentStop,
    PreCompact,
    SessionStart,
    SessionEnd,
    /// Any hook name this build does not know about.
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Wire name used in query strings and filters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Notification => "Notification",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instrumentation record.
///
/// Events are produced upstream and never mutated here; the core only
/// batches, stores and filters them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Reason a record was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidEvent {
    #[error("event is missing an id")]
    MissingId,
    #[error("event {0} is missing a session id")]
    MissingSessionId(String),
    #[error("malformed event record: {0}")]
    Malformed(String),
}

impl Event {
    /// Create an event with empty metadata.
    #[must_use]
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
            tool_name: None,
            duration_ms: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a tool name.
    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Check the identity fields.
    ///
    /// # Errors
    /// Returns the first missing identity field.
    pub fn validate(&self) -> Result<(), InvalidEvent> {
        if self.id.trim().is_empty() {
            return Err(InvalidEvent::MissingId);
        }
        if self.session_id.trim().is_empty() {
            return Err(InvalidEvent::MissingSessionId(self.id.clone()));
        }
        Ok(())
    }

    /// Decode an untyped JSON record and validate it.
    ///
    /// # Errors
    /// Returns an error if the record does not decode or lacks identity.
    pub fn from_value(value: Value) -> Result<Self, InvalidEvent> {
        let event: Self =
            serde_json::from_value(value).map_err(|e| InvalidEvent::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Completed,
    Error,
}

/// One logical unit of monitored agent activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<EventType>,
    #[serde(default)]
    pub minutes_since_last_event: i64,
}

impl Session {
    /// A session with an end time never becomes active again.
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Aggregated counters for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub total_events: u64,
    #[serde(default)]
    pub tool_usage: HashMap<String, u64>,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Inclusive time bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Filter for historical event queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub session_ids: Vec<String>,
    pub event_types: Vec<EventType>,
    pub search_query: Option<String>,
    pub date_range: Option<DateRange>,
}

impl EventFilter {
    /// Filter returning at most `limit` events.
    #[must_use]
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Search query with surrounding whitespace removed; `None` when blank.
    #[must_use]
    pub fn search(&self) -> Option<&str> {
        self.search_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// Whether an event satisfies every populated criterion.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.session_ids.is_empty() && !self.session_ids.contains(&event.session_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(range) = self.date_range {
            if event.timestamp < range.start || event.timestamp > range.end {
                return false;
            }
        }
        if let Some(query) = self.search() {
            let query = query.to_lowercase();
            let in_tool = event
                .tool_name
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&query));
            let in_type = event.event_type.as_str().to_lowercase().contains(&query);
            if !in_tool && !in_type {
                return false;
            }
        }
        true
    }
}

/// Filter for session queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Only sessions started within this many minutes.
    pub time_range_minutes: Option<u32>,
    /// Include sessions that already have an end time.
    pub include_ended: bool,
}
