//! Lifecycle of all configured MCP servers

use super::protocol::{JsonRpcRequest, JsonRpcResponse};
use super::{McpClient, McpError, McpTransport, StdioTransport};
use crate::config::McpServerConfig;
use crate::gateway::{ToolCatalog, ToolDescriptor, ToolTransport};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Connection summary for the servers endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub connected: bool,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Entry {
    client: Option<Arc<McpClient>>,
    description: Option<String>,
    tools: Vec<ToolDescriptor>,
    error: Option<String>,
}

#[derive(Default)]
pub struct McpManager {
    servers: RwLock<BTreeMap<String, Entry>>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and initialize every configured server. A server that fails to
    /// start is recorded with its error and skipped.
    pub async fn connect_all(
        configs: &BTreeMap<String, McpServerConfig>,
        request_timeout: Duration,
    ) -> Self {
        let manager = Self::new();
        for (name, config) in configs {
            let connected = match StdioTransport::spawn(name, config, request_timeout) {
                Ok(transport) => manager.attach(name, Arc::new(transport), config.description.clone()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = connected {
                tracing::warn!(server = %name, error = %e, "MCP server unavailable");
                manager.write().insert(
                    name.clone(),
                    Entry {
                        client: None,
                        description: config.description.clone(),
                        tools: Vec::new(),
                        error: Some(e.to_string()),
                    },
                );
            }
        }
        manager
    }

    /// Initialize a client over `transport` and register its tools
    pub async fn attach(
        &self,
        name: &str,
        transport: Arc<dyn McpTransport>,
        description: Option<String>,
    ) -> Result<(), McpError> {
        let client = Arc::new(McpClient::new(name, transport));
        client.initialize().await?;
        let tools: Vec<ToolDescriptor> = client
            .list_tools()
            .await?
            .into_iter()
            .map(|t| ToolDescriptor {
                server: name.to_string(),
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect();

        tracing::info!(server = %name, tools = tools.len(), "MCP server connected");
        self.write().insert(
            name.to_string(),
            Entry {
                client: Some(client),
                description,
                tools,
                error: None,
            },
        );
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.servers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.servers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, server: &str) -> Option<Arc<McpClient>> {
        self.read().get(server).and_then(|e| e.client.clone())
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.read()
            .iter()
            .map(|(name, entry)| ServerStatus {
                name: name.clone(),
                description: entry.description.clone(),
                connected: entry.client.as_ref().is_some_and(|c| c.is_connected()),
                tool_count: entry.tools.len(),
                error: entry.error.clone(),
            })
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.statuses().iter().filter(|s| s.connected).count()
    }

    pub async fn shutdown(&self) {
        let clients: Vec<Arc<McpClient>> = self.read().values().filter_map(|e| e.client.clone()).collect();
        for client in clients {
            client.close().await;
        }
    }
}

#[async_trait]
impl ToolTransport for McpManager {
    fn next_request_id(&self, server: &str) -> Option<u64> {
        self.client(server).map(|c| c.next_id())
    }

    async fn send(&self, server: &str, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let client = self.client(server).ok_or(McpError::Closed)?;
        client.send(request).await
    }

    fn catalog(&self) -> ToolCatalog {
        ToolCatalog::new(self.read().values().flat_map(|e| e.tools.clone()).collect())
    }
}

/// Tool names grouped by server, for the tools endpoint
pub fn tools_by_server(catalog: &ToolCatalog) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for tool in catalog.iter() {
        grouped.entry(tool.server.clone()).or_default().push(tool.name.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::super::client::tests::ScriptedServer;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_attach_registers_tools() {
        let manager = McpManager::new();
        manager
            .attach("weather", Arc::new(ScriptedServer::weather()), Some("날씨".to_string()))
            .await
            .unwrap();

        let catalog = manager.catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.find("get_weather").unwrap().server, "weather");

        let statuses = manager.statuses();
        assert_eq!(statuses[0].name, "weather");
        assert!(statuses[0].connected);
        assert_eq!(statuses[0].tool_count, 1);
        assert_eq!(manager.connected_count(), 1);
        assert_eq!(tools_by_server(&catalog)["weather"], vec!["get_weather"]);
    }

    #[tokio::test]
    async fn test_send_routes_to_server() {
        let manager = McpManager::new();
        manager
            .attach("weather", Arc::new(ScriptedServer::weather()), None)
            .await
            .unwrap();

        let id = manager.next_request_id("weather").unwrap();
        let request = JsonRpcRequest::new(
            id,
            "tools/call",
            Some(json!({"name": "get_weather", "arguments": {"location": "대구"}})),
        );
        let response = manager.send("weather", request).await.unwrap();
        assert_eq!(response.id, Some(id));
        assert_eq!(response.result.unwrap()["content"][0]["text"], "대구: 맑음, 23도");

        assert!(manager.next_request_id("nowhere").is_none());
    }

    #[tokio::test]
    async fn test_failed_server_is_reported() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "broken".to_string(),
            McpServerConfig {
                command: "/definitely/not/a/binary".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                description: None,
            },
        );
        let manager = McpManager::connect_all(&configs, Duration::from_secs(1)).await;

        let statuses = manager.statuses();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].connected);
        assert!(statuses[0].error.is_some());
        assert!(manager.catalog().is_empty());
    }
}
