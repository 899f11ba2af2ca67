//! `Capabilities` backed by an LLM and the live tool catalog

use super::prompt::{
    history_messages, response_prompt, server_status_text, think_prompt, tool_list_text,
    HELP_TEXT, REACT_SYSTEM_PROMPT, RESPONSE_SYSTEM_PROMPT,
};
use super::{Intent, IntentKind, IntentParser, ReplyParser};
use crate::gateway::{ToolCatalog, ToolDescriptor, ToolTransport};
use crate::llm::{LlmError, LlmMessage, LlmRequest, LlmService};
use crate::runtime::Capabilities;
use crate::session::Turn;
use crate::state_machine::{Decision, Observation, ReactTrace, ToolCall};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Server name used for actions naming a tool no server offers
const UNKNOWN_SERVER: &str = "unknown";

pub struct LlmCapabilities {
    llm: Arc<dyn LlmService>,
    tools: Arc<dyn ToolTransport>,
    intents: IntentParser,
    replies: ReplyParser,
}

impl LlmCapabilities {
    pub fn new(llm: Arc<dyn LlmService>, tools: Arc<dyn ToolTransport>) -> Self {
        Self {
            llm,
            tools,
            intents: IntentParser::new(),
            replies: ReplyParser::new(),
        }
    }

    /// Turn a raw reply into a decision
    fn decide(&self, reply: &str, catalog: &ToolCatalog, trace: &ReactTrace) -> Decision {
        let parsed = self.replies.parse(reply);
        if let Some(answer) = parsed.final_answer {
            return Decision::Final {
                thought: parsed.thought,
                answer,
            };
        }

        match parsed.action.as_deref().and_then(|a| self.replies.tool_action(a)) {
            Some((tool, argument)) => Decision::UseTool {
                thought: parsed.thought,
                call: bind(catalog, &tool, &argument),
            },
            // No usable action ends the loop. With data collected the
            // empty answer makes the summary the answer.
            None => Decision::Final {
                thought: parsed.thought,
                answer: if trace.cycles() > 0 {
                    String::new()
                } else {
                    reply.trim().to_string()
                },
            },
        }
    }
}

/// Route `tool` to its server and shape `argument` for the tool's schema.
/// A JSON object is passed through; anything else binds to the primary
/// argument.
fn bind(catalog: &ToolCatalog, tool: &str, argument: &str) -> ToolCall {
    let descriptor = catalog.find(tool);
    let server = descriptor.map_or(UNKNOWN_SERVER, |d| d.server.as_str());

    let arguments = match serde_json::from_str::<Value>(argument) {
        Ok(object @ Value::Object(_)) => object,
        _ if argument.is_empty() => Value::Object(Map::new()),
        _ => {
            let key = descriptor
                .and_then(ToolDescriptor::primary_argument)
                .unwrap_or("query");
            json!({ key: argument })
        }
    };
    ToolCall::new(server, tool, arguments)
}

#[async_trait]
impl Capabilities for LlmCapabilities {
    async fn parse_intent(&self, message: &str) -> Intent {
        let mut intent = self.intents.parse(message);
        if let Some(call) = intent.tool_call.as_mut() {
            if let Some(descriptor) = self.tools.catalog().find(&call.tool) {
                call.server.clone_from(&descriptor.server);
            }
        }
        intent
    }

    async fn think(&self, message: &str, history: &[Turn], trace: &ReactTrace) -> Result<Decision, LlmError> {
        let catalog = self.tools.catalog();
        let mut messages = history_messages(history);
        messages.push(LlmMessage::user(think_prompt(message, &catalog, trace)));

        let response = self
            .llm
            .complete(&LlmRequest::new(REACT_SYSTEM_PROMPT, messages))
            .await?;
        Ok(self.decide(&response.text, &catalog, trace))
    }

    async fn generate_response(
        &self,
        message: &str,
        history: &[Turn],
        intent: &Intent,
        observation: Option<&Observation>,
    ) -> Result<String, LlmError> {
        match intent.kind {
            IntentKind::Help => return Ok(HELP_TEXT.to_string()),
            IntentKind::ToolList => return Ok(tool_list_text(&self.tools.catalog())),
            IntentKind::ServerStatus => return Ok(server_status_text(&self.tools.catalog())),
            _ => {}
        }

        let mut messages = history_messages(history);
        messages.push(LlmMessage::user(response_prompt(message, observation)));

        let response = self
            .llm
            .complete(&LlmRequest::new(RESPONSE_SYSTEM_PROMPT, messages))
            .await?;
        let text = response.text.trim();
        if text.is_empty() {
            Ok("죄송합니다. 요청을 처리할 수 없습니다.".to_string())
        } else {
            Ok(text.to_string())
        }
    }
}
