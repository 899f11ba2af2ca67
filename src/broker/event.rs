//! Events streamed to the browser

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of a streamed event.
///
/// `SessionStart` and `SessionEnd` belong to the connection rather than to a
/// turn, but are numbered in the same per-session sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    Thinking,
    Acting,
    Observing,
    ToolCall,
    ToolResult,
    PartialResponse,
    FinalResponse,
    Error,
    SessionEnd,
}

impl EventKind {
    /// Whether this kind ends a turn's event sequence
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FinalResponse | Self::Error)
    }
}

/// One unit of progress, serialized as the SSE `data:` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
    /// Per-session sequence number, assigned by the broker
    pub sequence: u64,
}

impl StreamEvent {
    pub fn new(kind: EventKind, session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            metadata: json!({}),
            sequence: 0,
        }
    }

    /// Merge the keys of `extra` into the event metadata
    #[must_use]
    pub fn with_metadata(mut self, extra: Value) -> Self {
        if let (Value::Object(meta), Value::Object(extra)) = (&mut self.metadata, extra) {
            meta.extend(extra);
        }
        self
    }

    pub fn session_start(session_id: &str) -> Self {
        Self::new(EventKind::SessionStart, session_id, "세션이 시작되었습니다")
    }

    pub fn session_end(session_id: &str, reason: &str) -> Self {
        Self::new(EventKind::SessionEnd, session_id, "연결이 종료되었습니다")
            .with_metadata(json!({ "reason": reason }))
    }

    pub fn thinking(session_id: &str, iteration: u32, rationale: impl Into<String>) -> Self {
        Self::new(EventKind::Thinking, session_id, rationale)
            .with_metadata(json!({ "iteration": iteration }))
    }

    pub fn acting(session_id: &str, iteration: u32, content: impl Into<String>) -> Self {
        Self::new(EventKind::Acting, session_id, content)
            .with_metadata(json!({ "iteration": iteration }))
    }

    pub fn observing(session_id: &str, iteration: u32, content: impl Into<String>) -> Self {
        Self::new(EventKind::Observing, session_id, content)
            .with_metadata(json!({ "iteration": iteration }))
    }

    pub fn tool_call(session_id: &str, server: &str, tool: &str, arguments: &Value) -> Self {
        Self::new(EventKind::ToolCall, session_id, format!("{server}.{tool} 호출 중"))
            .with_metadata(json!({
                "server": server,
                "tool": tool,
                "status": "calling",
                "arguments": arguments,
            }))
    }

    pub fn tool_result(
        session_id: &str,
        server: &str,
        tool: &str,
        ok: bool,
        content: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::ToolResult, session_id, content).with_metadata(json!({
            "server": server,
            "tool": tool,
            "status": if ok { "success" } else { "failed" },
        }))
    }

    pub fn partial_response(session_id: &str, fragment: impl Into<String>) -> Self {
        Self::new(EventKind::PartialResponse, session_id, fragment)
            .with_metadata(json!({ "partial": true }))
    }

    pub fn final_response(session_id: &str, answer: impl Into<String>) -> Self {
        Self::new(EventKind::FinalResponse, session_id, answer)
            .with_metadata(json!({ "final": true }))
    }

    pub fn error(session_id: &str, message: &str) -> Self {
        Self::new(
            EventKind::Error,
            session_id,
            format!("오류가 발생했습니다: {message}"),
        )
        .with_metadata(json!({ "error": message }))
    }
}
