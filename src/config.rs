//! Startup configuration
//!
//! Everything is read once from the environment (plus the MCP servers file)
//! and then passed around by value; nothing here is consulted after startup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid MCP server config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// How to launch one MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parse the servers file. Accepts either `{name: config}` or the same map
/// wrapped in `{"servers": ...}`.
pub fn parse_server_configs(raw: &str) -> Result<BTreeMap<String, McpServerConfig>, serde_json::Error> {
    let mut value: Value = serde_json::from_str(raw)?;
    if let Some(inner) = value
        .get_mut("servers")
        .filter(|v| v.is_object())
        .map(Value::take)
    {
        value = inner;
    }
    serde_json::from_value(value)
}

/// Load the servers file; a missing file means no servers
pub fn load_server_configs(path: &Path) -> Result<BTreeMap<String, McpServerConfig>, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "MCP servers config not found, starting without tools");
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_server_configs(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub mcp_servers_config: PathBuf,
    pub audit_log: PathBuf,
    pub session_timeout: Duration,
    pub reaper_interval: Duration,
    pub max_connection_age: Duration,
    pub max_connections: usize,
    pub channel_capacity: usize,
    pub context_turns: usize,
    pub turn_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4.1".to_string(),
            temperature: 0.1,
            max_tokens: 1000,
            mcp_servers_config: PathBuf::from("./mcp_servers.json"),
            audit_log: PathBuf::from("logs/mcp_json_rpc.jsonl"),
            session_timeout: crate::session::SESSION_TIMEOUT,
            reaper_interval: crate::session::REAP_INTERVAL,
            max_connection_age: Duration::from_secs(60 * 60),
            max_connections: crate::broker::MAX_SUBSCRIPTIONS,
            channel_capacity: crate::broker::CHANNEL_CAPACITY,
            context_turns: crate::session::DEFAULT_CONTEXT_TURNS,
            turn_timeout: crate::runtime::TURN_TIMEOUT,
            tool_timeout: crate::gateway::TOOL_TIMEOUT,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        None => Ok(default),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            port: parse_var(&lookup, "MCP_HOST_PORT", d.port)?,
            openai_api_key: lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            openai_base_url: lookup("OPENAI_BASE_URL").unwrap_or(d.openai_base_url),
            openai_model: lookup("OPENAI_MODEL").unwrap_or(d.openai_model),
            temperature: parse_var(&lookup, "OPENAI_TEMPERATURE", d.temperature)?,
            max_tokens: parse_var(&lookup, "OPENAI_MAX_TOKENS", d.max_tokens)?,
            mcp_servers_config: lookup("MCP_SERVERS_CONFIG")
                .map_or(d.mcp_servers_config, PathBuf::from),
            audit_log: lookup("MCP_AUDIT_LOG").map_or(d.audit_log, PathBuf::from),
            session_timeout: parse_secs(&lookup, "SESSION_TIMEOUT_SECS", d.session_timeout)?,
            reaper_interval: parse_secs(&lookup, "REAPER_INTERVAL_SECS", d.reaper_interval)?,
            max_connection_age: parse_secs(&lookup, "MAX_CONNECTION_AGE_SECS", d.max_connection_age)?,
            max_connections: parse_var(&lookup, "MAX_CONNECTIONS", d.max_connections)?,
            channel_capacity: parse_var(&lookup, "CHANNEL_CAPACITY", d.channel_capacity)?,
            context_turns: parse_var(&lookup, "CONTEXT_TURNS", d.context_turns)?,
            turn_timeout: parse_secs(&lookup, "TURN_TIMEOUT_SECS", d.turn_timeout)?,
            tool_timeout: parse_secs(&lookup, "TOOL_TIMEOUT_SECS", d.tool_timeout)?,
        })
    }
}
