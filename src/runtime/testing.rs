//! Mock implementations for testing
//!
//! These mocks enable turn-level testing without a real LLM or MCP servers.

use crate::gateway::{ToolCatalog, ToolDescriptor, ToolTransport};
use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmService};
use crate::mcp::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::McpError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

// ============================================================================
// Mock LLM
// ============================================================================

/// What the mock LLM does for one request
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(LlmError),
    /// Never answers
    Hang,
}

/// LLM that replays queued replies, then echoes the last user message
pub struct MockLlmService {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl Default for MockLlmService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmService {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Text(text.into()));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.replies.lock().unwrap().push_back(MockReply::Error(error));
    }

    pub fn queue_hang(&self) {
        self.replies.lock().unwrap().push_back(MockReply::Hang);
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(MockReply::Text(text)) => Ok(LlmResponse::text(text)),
            Some(MockReply::Error(e)) => Err(e),
            Some(MockReply::Hang) => futures::future::pending().await,
            None => Ok(LlmResponse::text(format!(
                "echo: {}",
                request.last_user_text().unwrap_or_default()
            ))),
        }
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

// ============================================================================
// Mock MCP servers
// ============================================================================

/// Scripted outcome for one `tools/call`
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    RpcError { code: i64, message: String },
    /// Result with `isError: true`
    ToolError(String),
    TransportError,
    Hang,
}

/// A `weather` and a `file-manager` server answering from fixed data
pub struct MockToolTransport {
    catalog: ToolCatalog,
    scripted: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<(String, String, Value)>>,
    next_id: AtomicU64,
}

fn descriptor(server: &str, name: &str, description: &str, input_schema: Value) -> ToolDescriptor {
    ToolDescriptor {
        server: server.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

fn weather_text(location: &str) -> String {
    let conditions = match location {
        "서울" => "맑음, 23도",
        "부산" => "흐림, 20도",
        "대구" => "비, 18도",
        "인천" => "눈, 5도",
        _ => return format!("{location}: 정보 없음, 예상 온도 20도"),
    };
    format!("{location}: {conditions}")
}

impl MockToolTransport {
    pub fn weather() -> Self {
        let catalog = ToolCatalog::new(vec![
            descriptor(
                "weather",
                "get_weather",
                "현재 날씨 조회",
                json!({
                    "type": "object",
                    "properties": {"location": {"type": "string"}},
                    "required": ["location"]
                }),
            ),
            descriptor(
                "weather",
                "get_forecast",
                "날씨 예보 조회",
                json!({
                    "type": "object",
                    "properties": {
                        "location": {"type": "string"},
                        "days": {"type": "integer"}
                    },
                    "required": ["location"]
                }),
            ),
            descriptor(
                "file-manager",
                "list_files",
                "파일 목록 조회",
                json!({
                    "type": "object",
                    "properties": {"directory": {"type": "string"}}
                }),
            ),
        ]);
        Self {
            catalog,
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue a reply for the next call of `tool`
    #[must_use]
    pub fn with_reply(self, tool: &str, reply: ScriptedReply) -> Self {
        self.queue_reply(tool, reply);
        self
    }

    pub fn queue_reply(&self, tool: &str, reply: ScriptedReply) {
        self.scripted
            .lock()
            .unwrap()
            .entry(tool.to_string())
            .or_default()
            .push_back(reply);
    }

    /// `(server, tool, arguments)` for every call received
    pub fn recorded_calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn default_reply(tool: &str, arguments: &Value) -> ScriptedReply {
        let location = arguments
            .get("location")
            .and_then(Value::as_str)
            .unwrap_or("서울");
        match tool {
            "get_weather" => ScriptedReply::Text(weather_text(location)),
            "get_forecast" => {
                let days = arguments.get("days").and_then(Value::as_u64).unwrap_or(3);
                ScriptedReply::Text(format!("{location} {days}일 예보: 맑음, 흐림, 비"))
            }
            "list_files" => ScriptedReply::Text("README.md\nCargo.toml\nsrc/".to_string()),
            other => ScriptedReply::RpcError {
                code: -32601,
                message: format!("Unknown tool: {other}"),
            },
        }
    }
}

#[async_trait]
impl ToolTransport for MockToolTransport {
    fn next_request_id(&self, server: &str) -> Option<u64> {
        self.catalog
            .iter()
            .any(|t| t.server == server)
            .then(|| self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send(&self, server: &str, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let params = request.params.unwrap_or(Value::Null);
        let tool = params["name"].as_str().unwrap_or_default().to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        self.calls
            .lock()
            .unwrap()
            .push((server.to_string(), tool.clone(), arguments.clone()));

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&tool)
            .and_then(VecDeque::pop_front);
        let reply = scripted.unwrap_or_else(|| Self::default_reply(&tool, &arguments));

        match reply {
            ScriptedReply::Text(text) => Ok(JsonRpcResponse::success(
                request.id,
                json!({"content": [{"type": "text", "text": text}]}),
            )),
            ScriptedReply::ToolError(text) => Ok(JsonRpcResponse::success(
                request.id,
                json!({"content": [{"type": "text", "text": text}], "isError": true}),
            )),
            ScriptedReply::RpcError { code, message } => Ok(JsonRpcResponse::failure(
                request.id,
                JsonRpcError {
                    code,
                    message,
                    data: None,
                },
            )),
            ScriptedReply::TransportError => Err(McpError::Closed),
            ScriptedReply::Hang => futures::future::pending().await,
        }
    }

    fn catalog(&self) -> ToolCatalog {
        self.catalog.clone()
    }
}
