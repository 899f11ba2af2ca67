//! Effects produced by state transitions

use super::state::{Observation, Step, ToolCall};

/// A progress event to publish; the controller stamps the session id
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Thinking { iteration: u32, text: String },
    Acting { iteration: u32, text: String },
    ToolCall { call: ToolCall },
    Observing { iteration: u32, text: String },
    ToolResult { observation: Observation },
}

/// Effects to be executed after a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(Notice),

    /// Ask the reasoner for the next decision
    RequestThought { iteration: u32 },

    /// Call the tool through the gateway
    InvokeTool { call: ToolCall },

    /// Append a step to the trace
    RecordStep(Step),

    /// Stream the answer as partial responses then one final response
    StreamAnswer { answer: String },

    /// Append the assistant turn to the conversation
    PersistAnswer { answer: String },

    /// Publish the turn's error event
    FailTurn { error: String },
}

impl Effect {
    pub fn thinking(iteration: u32, text: impl Into<String>) -> Self {
        Effect::Publish(Notice::Thinking {
            iteration,
            text: text.into(),
        })
    }

    pub fn acting(iteration: u32, text: impl Into<String>) -> Self {
        Effect::Publish(Notice::Acting {
            iteration,
            text: text.into(),
        })
    }

    pub fn observing(iteration: u32, text: impl Into<String>) -> Self {
        Effect::Publish(Notice::Observing {
            iteration,
            text: text.into(),
        })
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Effect::RecordStep(Step::Thought { text: text.into() })
    }
}
