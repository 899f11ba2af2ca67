//! Model Context Protocol client side
//!
//! Spawns the configured MCP servers as child processes and talks JSON-RPC to
//! them over stdio.

mod client;
mod manager;
pub mod protocol;
mod transport;

pub use client::McpClient;
pub use manager::{tools_by_server, McpManager, ServerStatus};
pub use transport::{McpTransport, StdioTransport};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP transport closed")]
    Closed,
    #[error("MCP request timed out after {0:?}")]
    Timeout(Duration),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
