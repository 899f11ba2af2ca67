//! Prompt construction and parsing of ReAct replies

use crate::gateway::ToolCatalog;
use crate::llm::LlmMessage;
use crate::session::{Role, Turn};
use crate::state_machine::{Observation, ReactTrace};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write;

pub const RESPONSE_SYSTEM_PROMPT: &str = "당신은 친절하고 도움이 되는 AI 어시스턴트입니다.
사용자와의 연속적인 대화를 통해 맥락을 이해하고 일관성 있는 답변을 제공해주세요.

**도구 결과 활용**:
- 외부 도구(MCP 도구) 결과가 있다면, 그 결과를 바탕으로 답변해주세요
- 결과가 없거나 오류가 있다면, 일반적인 지식으로 최선의 답변을 제공해주세요

**응답 형식**:
- 마크다운 형식으로 답변을 작성해주세요
- 답변은 한국어로 친근하고 이해하기 쉽게 작성해주세요";

pub const REACT_SYSTEM_PROMPT: &str =
    "당신은 ReAct (Reasoning and Acting) 패턴을 사용하여 문제를 해결하는 AI입니다.";

pub const HELP_TEXT: &str = "MCP 호스트 도움말

사용 가능한 기능:
- 날씨: \"서울 날씨 알려줘\", \"부산 3일 예보\"
- 파일: \"파일 목록 보여줘\", \"README.md 정보\"
- 시스템: \"서버 상태\", \"도구 목록\"";

/// Earlier turns as chat messages, oldest first
pub fn history_messages(history: &[Turn]) -> Vec<LlmMessage> {
    history
        .iter()
        .map(|turn| match turn.role {
            Role::User => LlmMessage::user(turn.content.clone()),
            Role::Assistant => LlmMessage::assistant(turn.content.clone()),
        })
        .collect()
}

fn tool_lines(catalog: &ToolCatalog) -> String {
    let mut out = String::new();
    for tool in catalog.iter() {
        let description = tool.description.as_deref().unwrap_or("설명 없음");
        let _ = writeln!(out, "- {}: {description}", tool.name);
    }
    out
}

/// Prompt for one Thinking step
pub fn think_prompt(request: &str, catalog: &ToolCatalog, trace: &ReactTrace) -> String {
    let format_rules = "다음 형식으로 응답해주세요:

생각: [현재 상황을 분석하고 다음에 무엇을 해야 할지 생각해보세요]

행동: [도구를 사용할 때는 정확히 \"도구명: 인수\" 형식으로 작성하세요. 예: get_weather: 서울]

또는

최종 답변: [모든 필요한 정보를 수집했다면 최종 답변을 제공하세요]

중요:
- 행동은 반드시 \"도구명: 인수\" 형식으로 작성하세요 (번호나 기호 없이)
- 여러 위치의 정보가 필요한 경우, 한 번에 하나씩 처리하세요.";

    let observations: Vec<&Observation> = trace.observations().collect();
    let Some(last) = observations.last() else {
        return format!(
            "사용자 질문: {request}\n\n사용 가능한 도구들:\n{}\n{format_rules}",
            tool_lines(catalog)
        );
    };

    let mut collected = String::new();
    for (i, obs) in observations.iter().filter(|o| o.ok).enumerate() {
        let _ = writeln!(collected, "{}. {}: {}", i + 1, obs.call.tool, obs.text);
    }

    format!(
        "사용자 질문: {request}\n\n사용 가능한 도구들:\n{}\n이전 관찰 결과: {}\n\n지금까지 수집된 정보:\n{}\n위 결과를 바탕으로 다음 단계를 결정해주세요. 사용자가 요청한 모든 정보를 수집했는지 확인하세요.\n\n{format_rules}",
        tool_lines(catalog),
        last.render(),
        if collected.is_empty() { "없음\n".to_string() } else { collected },
    )
}

/// User content for a single-shot answer
pub fn response_prompt(message: &str, observation: Option<&Observation>) -> String {
    let mut content = format!("사용자 질문: {message}");
    if let Some(obs) = observation {
        let call = &obs.call;
        if obs.ok {
            let _ = write!(content, "\n\n방금 실행된 도구 결과:\n1. {}.{}: {}", call.server, call.tool, obs.text);
        } else {
            let _ = write!(content, "\n\n방금 실행된 도구 결과:\n1. {}.{}: 오류 - {}", call.server, call.tool, obs.text);
        }
        let _ = write!(content, "\n\n사용된 도구:\n- {}.{}({})", call.server, call.tool, call.arguments);
    }
    content
}

pub fn tool_list_text(catalog: &ToolCatalog) -> String {
    if catalog.is_empty() {
        return "사용 가능한 도구가 없습니다.".to_string();
    }
    let mut by_server: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for tool in catalog.iter() {
        by_server.entry(tool.server.as_str()).or_default().push(tool.name.as_str());
    }
    let mut out = "## 사용 가능한 도구 목록\n".to_string();
    for (server, tools) in by_server {
        let _ = write!(out, "\n### {server} 서버\n");
        for tool in tools {
            let _ = writeln!(out, "- {tool}");
        }
    }
    out
}

pub fn server_status_text(catalog: &ToolCatalog) -> String {
    let mut servers: Vec<&str> = catalog.iter().map(|t| t.server.as_str()).collect();
    servers.sort_unstable();
    servers.dedup();
    if servers.is_empty() {
        "연결된 서버가 없습니다.".to_string()
    } else {
        format!("연결된 서버: {}\n모든 서버가 정상 작동 중입니다.", servers.join(", "))
    }
}

/// The parts of a ReAct reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    pub thought: Option<String>,
    pub action: Option<String>,
    pub final_answer: Option<String>,
}

pub struct ReplyParser {
    final_answer: Vec<Regex>,
    action: Vec<Regex>,
    thought: Option<Regex>,
    section_end: Option<Regex>,
    tool_forms: Vec<Regex>,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
        };
        Self {
            final_answer: compile(&[
                r"(?is)최종\s*답변\s*:\s*(.+)",
                r"(?is)final\s*answer\s*:\s*(.+)",
                r"(?is)답변\s*:\s*(.+)",
            ]),
            action: compile(&[r"(?i)행동\s*:\s*(.+)", r"(?i)action\s*:\s*(.+)"]),
            thought: Regex::new(r"(?i)(?:생각|thought)\s*:\s*").ok(),
            section_end: Regex::new(r"(?i)행동|action|최종|final").ok(),
            tool_forms: compile(&[
                r"^(\w+)\s*:\s*(.+)$",
                r"^(\w+)\((.*)\)$",
                r"^\d+\.\s*(\w+)\s*:\s*(.+)$",
                r"^-\s*(\w+)\s*:\s*(.+)$",
            ]),
        }
    }

    /// Split a reply into thought, action and final answer. A final answer
    /// suppresses any action in the same reply.
    pub fn parse(&self, reply: &str) -> ParsedReply {
        let thought = self.thought(reply);

        if let Some(answer) = first_capture(&self.final_answer, reply) {
            return ParsedReply {
                thought,
                action: None,
                final_answer: Some(answer),
            };
        }

        ParsedReply {
            thought,
            action: first_capture(&self.action, reply),
            final_answer: None,
        }
    }

    fn thought(&self, reply: &str) -> Option<String> {
        let start = self.thought.as_ref()?.find(reply)?.end();
        let rest = reply.get(start..)?;
        let end = self
            .section_end
            .as_ref()
            .and_then(|re| re.find(rest))
            .map_or(rest.len(), |m| m.start());
        let text = rest.get(..end)?.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// `(tool, argument)` from an action line such as `get_weather: 서울`,
    /// `get_weather(서울)`, `1. get_weather: 서울` or `- get_weather: 서울`
    pub fn tool_action(&self, action: &str) -> Option<(String, String)> {
        let action = action.trim();
        self.tool_forms.iter().find_map(|re| {
            re.captures(action).map(|c| {
                let argument = c[2].trim().trim_matches(|ch| ch == '"' || ch == '\'');
                (c[1].to_string(), argument.to_string())
            })
        })
    }
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .map(|c| c[1].trim().to_string())
            .filter(|s| !s.is_empty())
    })
}
