//! Append-only audit trail of tool invocations
//!
//! Every call produces two records sharing a correlation id: one written
//! before the request is dispatched and one once the outcome is known.

use crate::mcp::protocol::JsonRpcRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success { result: String },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocationRecord {
    pub phase: AuditPhase,
    pub correlation_id: String,
    pub server: String,
    pub tool: String,
    pub arguments: Value,
    pub requested_at: DateTime<Utc>,
    /// The literal JSON-RPC request
    pub request: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AuditOutcome>,
    /// The literal JSON-RPC response, when one arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolInvocationRecord {
    pub fn request(
        correlation_id: &str,
        server: &str,
        tool: &str,
        arguments: &Value,
        request: &JsonRpcRequest,
    ) -> Self {
        Self {
            phase: AuditPhase::Request,
            correlation_id: correlation_id.to_string(),
            server: server.to_string(),
            tool: tool.to_string(),
            arguments: arguments.clone(),
            requested_at: Utc::now(),
            request: serde_json::to_value(request).unwrap_or(Value::Null),
            outcome: None,
            response: None,
            responded_at: None,
            duration_ms: None,
        }
    }

    /// The completed counterpart of a request record
    #[must_use]
    pub fn completed(&self, outcome: AuditOutcome, response: Option<Value>) -> Self {
        let responded_at = Utc::now();
        let duration_ms = (responded_at - self.requested_at)
            .num_milliseconds()
            .try_into()
            .unwrap_or(0);
        Self {
            phase: AuditPhase::Response,
            outcome: Some(outcome),
            response,
            responded_at: Some(responded_at),
            duration_ms: Some(duration_ms),
            ..self.clone()
        }
    }
}

/// Destination for audit records. Writing must never fail the tool call.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &ToolInvocationRecord);
}

/// One JSON object per line, appended to a file
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
}

impl JsonlAuditLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(tokio::sync::Mutex::new(file)),
        })
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, record: &ToolInvocationRecord) {
        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize audit record");
                return;
            }
        };
        line.push('\n');

        // A line is written on its own task so a dropped caller cannot leave
        // it half written
        let file = self.file.clone();
        let write = tokio::spawn(async move {
            let mut file = file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        });
        let written = write.await.unwrap_or_else(|e| Err(std::io::Error::other(e)));
        if let Err(e) = written {
            tracing::warn!(
                path = %self.path.display(),
                correlation_id = %record.correlation_id,
                error = %e,
                "Failed to write audit record"
            );
        }
    }
}

/// Keeps records in memory; used when no audit file can be opened
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<ToolInvocationRecord>>,
}

impl MemoryAuditLog {
    #[cfg(test)]
    pub fn records(&self) -> Vec<ToolInvocationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, record: &ToolInvocationRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
