//! Audited tool invocation
//!
//! The gateway turns a `(server, tool, arguments)` triple into a JSON-RPC
//! `tools/call` exchange, bounds it with a timeout, records both halves to the
//! audit sink, and hands back a typed outcome. It never panics on a bad tool;
//! failures come back as [`ToolError`] values for the caller to absorb.

mod audit;

pub use audit::{AuditOutcome, AuditSink, JsonlAuditLog, MemoryAuditLog};
#[cfg(test)]
pub use audit::AuditPhase;

use audit::ToolInvocationRecord;

use crate::mcp::protocol::{CallToolParams, CallToolResult, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::McpError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default per-call timeout
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A tool exposed by one of the connected servers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// The argument a bare string should be bound to: the first required
    /// property, else the first declared one
    pub fn primary_argument(&self) -> Option<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .or_else(|| {
                self.input_schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .and_then(|p| p.keys().next())
                    .map(String::as_str)
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    pub fn find(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Where the gateway sends its requests
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Next request id for `server`, or `None` if the server is unknown
    fn next_request_id(&self, server: &str) -> Option<u64>;

    async fn send(&self, server: &str, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    fn catalog(&self) -> ToolCatalog;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSuccess {
    /// Text rendering of the result content
    pub text: String,
    /// The raw `result` object
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Unknown MCP server: {0}")]
    UnknownServer(String),
    #[error("Tool call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Tool error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("Tool reported failure: {0}")]
    ToolReported(String),
}

impl From<McpError> for ToolError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Timeout(after) => ToolError::Timeout(after),
            McpError::Rpc { code, message } => ToolError::Rpc {
                code,
                message,
                data: None,
            },
            other => ToolError::Transport(other.to_string()),
        }
    }
}

fn interpret(response: JsonRpcResponse) -> Result<ToolSuccess, ToolError> {
    if let Some(error) = response.error {
        return Err(ToolError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    let result = response
        .result
        .ok_or_else(|| ToolError::Transport("response has neither result nor error".to_string()))?;
    let parsed: CallToolResult = serde_json::from_value(result.clone())
        .map_err(|e| ToolError::Transport(format!("malformed tools/call result: {e}")))?;

    let text = parsed.text();
    if parsed.is_error {
        return Err(ToolError::ToolReported(text));
    }
    Ok(ToolSuccess { text, result })
}

pub struct ToolGateway {
    transport: Arc<dyn ToolTransport>,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl ToolGateway {
    pub fn new(transport: Arc<dyn ToolTransport>, audit: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self {
            transport,
            audit,
            timeout,
        }
    }

    pub fn catalog(&self) -> ToolCatalog {
        self.transport.catalog()
    }

    /// Call `tool` on `server`, auditing the request and its outcome
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        correlation_id: &str,
    ) -> Result<ToolSuccess, ToolError> {
        let request_id = self.transport.next_request_id(server);
        let request = JsonRpcRequest::new(
            request_id.unwrap_or(0),
            "tools/call",
            serde_json::to_value(CallToolParams {
                name: tool.to_string(),
                arguments: arguments.clone(),
            })
            .ok(),
        );
        let pending = ToolInvocationRecord::request(correlation_id, server, tool, &arguments, &request);
        self.audit.record(&pending).await;

        let started = Instant::now();
        let mut raw_response = None;
        let outcome = if request_id.is_none() {
            Err(ToolError::UnknownServer(server.to_string()))
        } else {
            match tokio::time::timeout(self.timeout, self.transport.send(server, request)).await {
                Err(_) => Err(ToolError::Timeout(self.timeout)),
                Ok(Err(e)) => Err(ToolError::from(e)),
                Ok(Ok(response)) => {
                    raw_response = serde_json::to_value(&response).ok();
                    interpret(response)
                }
            }
        };
        let duration_ms = started.elapsed().as_millis();

        let audit_outcome = match &outcome {
            Ok(success) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    server = %server,
                    tool = %tool,
                    duration_ms = %duration_ms,
                    "Tool call succeeded"
                );
                AuditOutcome::Success {
                    result: success.text.clone(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    server = %server,
                    tool = %tool,
                    duration_ms = %duration_ms,
                    error = %e,
                    "Tool call failed"
                );
                AuditOutcome::Error {
                    error: e.to_string(),
                }
            }
        };
        self.audit
            .record(&pending.completed(audit_outcome, raw_response))
            .await;

        outcome
    }
}
