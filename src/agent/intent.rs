//! Keyword intent detection for single-shot turns

use crate::state_machine::ToolCall;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

/// Cities the weather tools know about
pub const KNOWN_CITIES: [&str; 7] = ["서울", "부산", "대구", "인천", "광주", "대전", "울산"];

const DEFAULT_CITY: &str = "서울";
const DEFAULT_FORECAST_DAYS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    WeatherQuery,
    FileOperation,
    ServerStatus,
    ToolList,
    Help,
    GeneralChat,
}

/// What a message asks for, and the tool call that would answer it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    pub tool_call: Option<ToolCall>,
}

impl Intent {
    pub fn general() -> Self {
        Self {
            kind: IntentKind::GeneralChat,
            confidence: 0.8,
            tool_call: None,
        }
    }
}

pub struct IntentParser {
    patterns: Vec<(IntentKind, Vec<Regex>)>,
    days: Option<Regex>,
}

impl Default for IntentParser {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

impl IntentParser {
    pub fn new() -> Self {
        Self {
            patterns: vec![
                (
                    IntentKind::WeatherQuery,
                    compile(&[
                        "날씨|기온|온도|비|눈|맑음|흐림",
                        "weather|temperature|rain|snow|sunny|cloudy",
                    ]),
                ),
                (
                    IntentKind::FileOperation,
                    compile(&[
                        "파일|디렉토리|폴더|목록|읽기|저장",
                        "file|directory|folder|list|read|save",
                    ]),
                ),
                (
                    IntentKind::ServerStatus,
                    compile(&["서버|상태|연결|접속", "server|status|connect|connection"]),
                ),
                (
                    IntentKind::ToolList,
                    compile(&["도구|툴|기능|명령어|help", "tool|function|command|help"]),
                ),
                (
                    IntentKind::Help,
                    compile(&["도움말|사용법|어떻게|방법", "help|how|usage|guide"]),
                ),
            ],
            days: Regex::new(r"(\d+)일").ok(),
        }
    }

    pub fn parse(&self, message: &str) -> Intent {
        let lower = message.to_lowercase();

        // Highest keyword score wins; ties go to the earlier intent
        let mut best: Option<(IntentKind, usize)> = None;
        for (kind, patterns) in &self.patterns {
            let score: usize = patterns.iter().map(|re| re.find_iter(&lower).count()).sum();
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((*kind, score));
            }
        }

        let Some((kind, score)) = best else {
            return Intent::general();
        };

        #[allow(clippy::cast_precision_loss)]
        let confidence = (score as f32 * 0.3).min(1.0);
        let tool_call = match kind {
            IntentKind::WeatherQuery => Some(self.weather_call(message)),
            IntentKind::FileOperation => Some(file_call(message)),
            _ => None,
        };

        tracing::debug!(intent = ?kind, confidence, "Intent parsed");
        Intent {
            kind,
            confidence,
            tool_call,
        }
    }

    fn weather_call(&self, message: &str) -> ToolCall {
        let location = KNOWN_CITIES
            .iter()
            .find(|city| message.contains(*city))
            .copied()
            .unwrap_or(DEFAULT_CITY);

        if message.contains("예보") || message.to_lowercase().contains("forecast") {
            let days = self
                .days
                .as_ref()
                .and_then(|re| re.captures(message))
                .and_then(|c| c[1].parse::<u64>().ok())
                .unwrap_or(DEFAULT_FORECAST_DAYS);
            ToolCall::new(
                "weather",
                "get_forecast",
                json!({ "location": location, "days": days }),
            )
        } else {
            ToolCall::new("weather", "get_weather", json!({ "location": location }))
        }
    }
}

fn file_call(message: &str) -> ToolCall {
    let lower = message.to_lowercase();
    let (tool, arguments): (&str, Value) = if message.contains("목록") || lower.contains("list") {
        ("list_files", json!({ "directory": "." }))
    } else if message.contains("읽기") || lower.contains("read") {
        ("read_file", json!({ "filename": "README.md" }))
    } else if message.contains("정보") || lower.contains("info") {
        ("file_info", json!({ "filename": "README.md" }))
    } else {
        ("list_files", json!({ "directory": "." }))
    };
    ToolCall::new("file-manager", tool, arguments)
}
