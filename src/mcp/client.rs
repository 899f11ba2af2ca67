//! High-level client for one MCP server

use super::protocol::{
    ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, McpTool, PROTOCOL_VERSION,
};
use super::{McpError, McpTransport};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,
    request_id: AtomicU64,
}

impl McpClient {
    pub fn new(name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            request_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next JSON-RPC request id for this server
    pub fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn result_of(response: JsonRpcResponse) -> Result<Value, McpError> {
        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| McpError::Protocol("response has neither result nor error".to_string()))
    }

    /// Run the initialize handshake and announce readiness
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: "mcp_host".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let request = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params)?),
        );

        let response = self.transport.request(request).await?;
        let result: InitializeResult = serde_json::from_value(Self::result_of(response)?)?;

        self.transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        tracing::info!(
            server = %self.name,
            server_name = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP client initialized"
        );
        Ok(result)
    }

    /// Fetch the server's tool list
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let request = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let response = self.transport.request(request).await?;
        let result: ListToolsResult = serde_json::from_value(Self::result_of(response)?)?;
        Ok(result.tools)
    }

    /// Send a prepared request as-is
    pub async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        self.transport.request(request).await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
