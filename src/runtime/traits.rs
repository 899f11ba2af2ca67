//! Trait abstractions for turn execution
//!
//! The controller and the single-shot pipeline only talk to the reasoning
//! layer through `Capabilities`, which lets tests swap in scripted LLMs.

use crate::agent::Intent;
use crate::llm::LlmError;
use crate::session::Turn;
use crate::state_machine::{Decision, Observation, ReactTrace, ReactState};
use async_trait::async_trait;
use std::sync::Arc;

/// The closed set of processing steps a turn can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    ParseIntent,
    CallTool,
    GenerateResponse,
    Think,
    Act,
    Observe,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Node::ParseIntent => "parse_intent",
            Node::CallTool => "call_tool",
            Node::GenerateResponse => "generate_response",
            Node::Think => "think",
            Node::Act => "act",
            Node::Observe => "observe",
        }
    }

    /// The node a ReAct state is running, if any
    pub fn for_state(state: &ReactState) -> Option<Node> {
        match state {
            ReactState::Thinking { .. } => Some(Node::Think),
            ReactState::Acting { .. } => Some(Node::Act),
            ReactState::Observing { .. } => Some(Node::Observe),
            ReactState::Responding { .. } => Some(Node::GenerateResponse),
            ReactState::Done | ReactState::Failed { .. } => None,
        }
    }
}

/// One method per reasoning capability. Tool calls go through the gateway
/// and observation is pure, so neither appears here.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Classify a message and pick at most one tool call for it
    async fn parse_intent(&self, message: &str) -> Intent;

    /// Decide the next ReAct step
    async fn think(&self, message: &str, history: &[Turn], trace: &ReactTrace) -> Result<Decision, LlmError>;

    /// Produce the single-shot answer
    async fn generate_response(
        &self,
        message: &str,
        history: &[Turn],
        intent: &Intent,
        observation: Option<&Observation>,
    ) -> Result<String, LlmError>;
}

#[async_trait]
impl<T: Capabilities + ?Sized> Capabilities for Arc<T> {
    async fn parse_intent(&self, message: &str) -> Intent {
        (**self).parse_intent(message).await
    }

    async fn think(&self, message: &str, history: &[Turn], trace: &ReactTrace) -> Result<Decision, LlmError> {
        (**self).think(message, history, trace).await
    }

    async fn generate_response(
        &self,
        message: &str,
        history: &[Turn],
        intent: &Intent,
        observation: Option<&Observation>,
    ) -> Result<String, LlmError> {
        (**self).generate_response(message, history, intent, observation).await
    }
}
