//! ReAct state and trace types

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

/// Think/Act/Observe cycles allowed per turn
pub const MAX_ITERATIONS: u32 = 5;

/// Word overlap above which two consecutive observations count as no progress
const STAGNATION_THRESHOLD: f64 = 0.8;

/// A tool call chosen by the reasoner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            arguments,
        }
    }

    /// Value of a string argument
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    /// `tool: value` for a single-argument call, `tool: {json}` otherwise
    pub fn describe(&self) -> String {
        match self.arguments.as_object() {
            Some(map) if map.len() == 1 => match map.values().next() {
                Some(Value::String(s)) => format!("{}: {s}", self.tool),
                Some(other) => format!("{}: {other}", self.tool),
                None => self.tool.clone(),
            },
            Some(map) if map.is_empty() => self.tool.clone(),
            _ => format!("{}: {}", self.tool, self.arguments),
        }
    }
}

/// Outcome of one tool call as seen by the reasoner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub call: ToolCall,
    pub correlation_id: String,
    pub ok: bool,
    /// Result text on success, error text on failure
    pub text: String,
}

impl Observation {
    pub fn success(call: ToolCall, correlation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            call,
            correlation_id: correlation_id.into(),
            ok: true,
            text: text.into(),
        }
    }

    pub fn failure(call: ToolCall, correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call,
            correlation_id: correlation_id.into(),
            ok: false,
            text: error.into(),
        }
    }

    pub fn render(&self) -> String {
        if self.ok {
            format!("도구 '{}' 실행 성공: {}", self.call.tool, self.text)
        } else {
            format!("도구 '{}' 실행 실패: {}", self.call.tool, self.text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Thought { text: String },
    Action { call: ToolCall },
    Observation { observation: Observation },
}

/// Per-turn record of the reasoning so far. Discarded once the turn resolves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactTrace {
    /// The user message being answered
    pub request: String,
    pub steps: Vec<Step>,
}

impl ReactTrace {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            steps: Vec::new(),
        }
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.steps.iter().filter_map(|s| match s {
            Step::Observation { observation } => Some(observation),
            _ => None,
        })
    }

    /// Completed Think/Act/Observe cycles
    pub fn cycles(&self) -> u32 {
        u32::try_from(self.observations().count()).unwrap_or(u32::MAX)
    }

    /// True when the last two observations are nearly the same text
    pub fn stagnated(&self) -> bool {
        let recent: Vec<String> = self.observations().map(Observation::render).collect();
        match recent.as_slice() {
            [.., prev, last] => word_overlap(prev, last) > STAGNATION_THRESHOLD,
            _ => false,
        }
    }

    /// Best-effort answer assembled from the observations
    pub fn summary(&self) -> String {
        let (succeeded, failed): (Vec<&Observation>, Vec<&Observation>) =
            self.observations().partition(|o| o.ok);

        if succeeded.is_empty() && failed.is_empty() {
            return format!(
                "'{}' 요청을 분석했지만, 추가 정보 수집이 필요하지 않아 일반적인 답변을 제공합니다.",
                self.request
            );
        }

        let mut parts = vec![format!("## {}\n", self.request)];

        if !succeeded.is_empty() {
            parts.push("### 수집된 정보:".to_string());
            for (i, obs) in succeeded.iter().enumerate() {
                parts.push(format!("\n**{}. {}:**", i + 1, heading(&obs.call)));
                parts.push(format!("- {}", obs.text));
            }
        }

        if !failed.is_empty() {
            parts.push("\n### 처리 중 발생한 문제:".to_string());
            for (i, obs) in failed.iter().enumerate() {
                parts.push(format!("{}. {} 실행 실패: {}", i + 1, obs.call.tool, obs.text));
            }
        }

        let weather: Vec<&&Observation> = succeeded
            .iter()
            .filter(|o| matches!(o.call.tool.as_str(), "get_weather" | "get_forecast"))
            .collect();
        if weather.len() > 1 && self.request.contains("비교") {
            parts.push("\n### 비교 분석:".to_string());
            parts.push(format!(
                "총 {}개 지역의 날씨 정보를 수집했습니다:",
                weather.len()
            ));
            let locations: Vec<String> = weather
                .iter()
                .map(|o| format!("{}({})", o.call.argument("location").unwrap_or("알 수 없는 위치"), o.text))
                .collect();
            parts.push(format!("- {}", locations.join(", ")));
        }

        parts.join("\n")
    }
}

fn heading(call: &ToolCall) -> String {
    let location = call.argument("location").unwrap_or("알 수 없는 위치");
    match call.tool.as_str() {
        "get_weather" => format!("{location} 날씨"),
        "get_forecast" => {
            let days = call.arguments.get("days").and_then(Value::as_u64).unwrap_or(3);
            format!("{location} {days}일 예보")
        }
        other => other.to_string(),
    }
}

/// Shared distinct words over the longer text's word count
#[allow(clippy::cast_precision_loss)]
fn word_overlap(a: &str, b: &str) -> f64 {
    let a_words: Vec<&str> = a.split_whitespace().collect();
    let b_words: Vec<&str> = b.split_whitespace().collect();
    let longest = a_words.len().max(b_words.len());
    if longest == 0 {
        return 0.0;
    }
    let a_set: HashSet<&str> = a_words.into_iter().collect();
    let b_set: HashSet<&str> = b_words.into_iter().collect();
    a_set.intersection(&b_set).count() as f64 / longest as f64
}

/// Controller state for one ReAct turn
#[derive(Debug, Clone, PartialEq)]
pub enum ReactState {
    /// Waiting on the reasoner for cycle `iteration`
    Thinking { iteration: u32 },
    /// Tool call in flight
    Acting { iteration: u32, call: ToolCall },
    /// Outcome known, being recorded
    Observing {
        iteration: u32,
        observation: Observation,
    },
    /// Streaming the answer
    Responding { answer: String, forced: bool },
    Done,
    Failed { error: String },
}

impl ReactState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReactState::Done | ReactState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReactState::Thinking { .. } => "thinking",
            ReactState::Acting { .. } => "acting",
            ReactState::Observing { .. } => "observing",
            ReactState::Responding { .. } => "responding",
            ReactState::Done => "done",
            ReactState::Failed { .. } => "failed",
        }
    }
}
