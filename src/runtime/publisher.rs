//! Per-turn event publishing
//!
//! Stamps every event of a turn with the session and turn ids and enforces
//! the terminal rule: after the turn's `final_response` or `error`, nothing
//! more is published for it.

use super::traits::Node;
use crate::broker::{EventSender, StreamEvent};
use crate::state_machine::{Notice, Observation, ToolCall};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

/// Longest run of characters emitted as one fragment
const MAX_FRAGMENT_CHARS: usize = 15;

pub struct TurnPublisher {
    events: EventSender,
    session_id: String,
    turn_id: String,
    finished: AtomicBool,
}

impl TurnPublisher {
    pub fn new(events: EventSender, session_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            events,
            session_id: session_id.into(),
            turn_id: turn_id.into(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn emit(&self, node: Option<Node>, event: StreamEvent) {
        if event.kind.is_terminal() {
            if self.finished.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    session_id = %self.session_id,
                    turn_id = %self.turn_id,
                    kind = ?event.kind,
                    "Dropping second terminal event"
                );
                return;
            }
        } else if self.is_finished() {
            tracing::debug!(turn_id = %self.turn_id, kind = ?event.kind, "Turn finished, event dropped");
            return;
        }

        let mut meta = json!({ "turn_id": self.turn_id });
        if let Some(node) = node {
            meta["node"] = json!(node.as_str());
        }
        self.events.publish(event.with_metadata(meta));
    }

    pub fn notice(&self, notice: Notice) {
        let sid = self.session_id.as_str();
        match notice {
            Notice::Thinking { iteration, text } => {
                self.emit(Some(Node::Think), StreamEvent::thinking(sid, iteration, text));
            }
            Notice::Acting { iteration, text } => {
                self.emit(Some(Node::Act), StreamEvent::acting(sid, iteration, text));
            }
            Notice::ToolCall { call } => self.tool_call(Node::Act, &call),
            Notice::Observing { iteration, text } => {
                self.emit(Some(Node::Observe), StreamEvent::observing(sid, iteration, text));
            }
            Notice::ToolResult { observation } => self.tool_result(Node::Observe, &observation),
        }
    }

    pub fn tool_call(&self, node: Node, call: &ToolCall) {
        self.emit(
            Some(node),
            StreamEvent::tool_call(&self.session_id, &call.server, &call.tool, &call.arguments),
        );
    }

    pub fn tool_result(&self, node: Node, observation: &Observation) {
        let event = StreamEvent::tool_result(
            &self.session_id,
            &observation.call.server,
            &observation.call.tool,
            observation.ok,
            observation.text.clone(),
        )
        .with_metadata(json!({ "correlation_id": observation.correlation_id }));
        self.emit(Some(node), event);
    }

    /// Word-granular `partial_response` fragments, then the whole answer as
    /// the turn's `final_response`
    pub fn stream_answer(&self, answer: &str) {
        for fragment in word_chunks(answer) {
            self.emit(
                Some(Node::GenerateResponse),
                StreamEvent::partial_response(&self.session_id, fragment),
            );
        }
        self.emit(
            Some(Node::GenerateResponse),
            StreamEvent::final_response(&self.session_id, answer),
        );
    }

    pub fn error(&self, message: &str) {
        self.emit(None, StreamEvent::error(&self.session_id, message));
    }
}

fn is_break(c: char) -> bool {
    c.is_whitespace() || ".!?,;:。！？，；：".contains(c)
}

/// Split `text` at word boundaries. Concatenating the fragments gives back
/// `text`. Whitespace only stands alone when the text is nothing else.
pub fn word_chunks(text: &str) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut len = 0;

    for c in text.chars() {
        buf.push(c);
        len += 1;
        if (is_break(c) || len >= MAX_FRAGMENT_CHARS) && !buf.trim().is_empty() {
            chunks.push(std::mem::take(&mut buf));
            len = 0;
        }
    }

    if !buf.is_empty() {
        match chunks.last_mut() {
            Some(last) if buf.trim().is_empty() => last.push_str(&buf),
            _ => chunks.push(buf),
        }
    }
    chunks
}
