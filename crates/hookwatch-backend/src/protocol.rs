//! Wire protocols for the live sockets.

use hookwatch_core::{Event, Session};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame pushed by the self-hosted server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketFrame {
    /// A new instrumentation event.
    Event { data: Event },
    /// A created or refreshed session.
    Session { data: Session },
    /// Server-side failure report.
    Error { error: String },
}

/// Why an inbound frame was not routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRejection {
    /// `type` was missing or not one we route.
    UnknownType(Option<String>),
    /// Known `type` but the payload did not decode.
    Malformed { kind: String, reason: String },
}

impl std::fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(Some(kind)) => write!(f, "unrecognized frame type '{kind}'"),
            Self::UnknownType(None) => write!(f, "frame has no type"),
            Self::Malformed { kind, reason } => write!(f, "malformed '{kind}' frame: {reason}"),
        }
    }
}

impl SocketFrame {
    /// Decode a text frame, distinguishing unknown types from bad payloads.
    ///
    /// # Errors
    /// Returns the reason the frame cannot be routed.
    pub fn parse(text: &str) -> Result<Self, FrameRejection> {
        let value: Value = serde_json::from_str(text).map_err(|e| FrameRejection::Malformed {
            kind: "?".to_string(),
            reason: e.to_string(),
        })?;
        let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
        match kind.as_deref() {
            Some("event" | "session" | "error") => {}
            _ => return Err(FrameRejection::UnknownType(kind)),
        }
        serde_json::from_value(value).map_err(|e| FrameRejection::Malformed {
            kind: kind.unwrap_or_default(),
            reason: e.to_string(),
        })
    }
}

/// Envelope of the Phoenix channel protocol spoken by the managed realtime
/// service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const SYSTEM: &str = "system";
pub const POSTGRES_CHANGES: &str = "postgres_changes";
pub const PHOENIX_TOPIC: &str = "phoenix";

impl PhoenixMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: None,
            join_ref: None,
        }
    }

    #[must_use]
    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Join request subscribing to row changes on each of `tables`.
    #[must_use]
    pub fn join(topic: &str, tables: &[&str], msg_ref: String) -> Self {
        let changes: Vec<Value> = tables
            .iter()
            .map(|table| serde_json::json!({ "event": "*", "schema": "public", "table": table }))
            .collect();
        let payload = serde_json::json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes
            }
        });
        Self {
            join_ref: Some(msg_ref.clone()),
            ..Self::new(topic, PHX_JOIN, payload).with_ref(msg_ref)
        }
    }

    #[must_use]
    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(PHOENIX_TOPIC, HEARTBEAT, serde_json::json!({})).with_ref(msg_ref)
    }

    /// `status` of a `phx_reply`.
    #[must_use]
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// Human-readable reason carried by an error reply.
    #[must_use]
    pub fn reply_reason(&self) -> Option<String> {
        let response = self.payload.get("response")?;
        response
            .get("reason")
            .or_else(|| response.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(response.to_string()))
    }

    /// Table named by a `postgres_changes` message.
    #[must_use]
    pub fn change_table(&self) -> Option<&str> {
        self.payload.get("data")?.get("table")?.as_str()
    }

    /// The changed row of a `postgres_changes` message.
    #[must_use]
    pub fn change_record(&self) -> Option<&Value> {
        let data = self.payload.get("data")?;
        data.get("record").or_else(|| data.get("new"))
    }
}
