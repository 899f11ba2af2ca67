//! Events that drive a ReAct turn

use super::state::{Observation, ToolCall};

/// What the reasoner decided in one Thinking step
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Stop and answer
    Final {
        thought: Option<String>,
        answer: String,
    },
    /// Call a tool, then think again
    UseTool {
        thought: Option<String>,
        call: ToolCall,
    },
}

impl Decision {
    pub fn thought(&self) -> Option<&str> {
        match self {
            Decision::Final { thought, .. } | Decision::UseTool { thought, .. } => thought.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactEvent {
    Decided(Decision),
    /// The reasoner's LLM call failed
    ThinkFailed { error: String },
    /// The tool call finished, successfully or not
    ToolFinished { observation: Observation },
    ObservationRecorded,
    AnswerDelivered,
    /// The whole-turn deadline passed
    TimedOut { after_secs: u64 },
}
