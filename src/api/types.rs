//! API request and response types

use crate::broker::BrokerStats;
use crate::gateway::ToolDescriptor;
use crate::mcp::ServerStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request to start a streamed turn
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: String,
    pub session_id: String,
    #[serde(default)]
    pub react_mode: bool,
}

/// Response for a queued turn; progress arrives on the stream
#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub success: bool,
    pub turn_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub session_id: String,
}

/// Request for a turn answered in the response body
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub react_mode: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub success: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected_servers: Vec<String>,
    pub available_tools_count: usize,
    pub active_sessions: usize,
    pub active_workers: usize,
    pub streams: BrokerStats,
}

#[derive(Debug, Serialize)]
pub struct ServersResponse {
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub total_tools: usize,
    pub tools: Vec<ToolDescriptor>,
    pub tools_by_server: HashMap<String, Vec<String>>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}
