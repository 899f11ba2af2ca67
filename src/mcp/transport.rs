//! Transport layer for MCP servers

use super::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use super::McpError;
use crate::config::McpServerConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Request/response channel to one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the matching response
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification; no response is expected
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request's slot in the pending map, released when the request ends,
/// times out or is dropped by its caller
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl<'a> PendingEntry<'a> {
    fn register(pending: &'a Pending, id: u64, tx: oneshot::Sender<JsonRpcResponse>) -> Self {
        lock(pending).insert(id, tx);
        Self { pending, id }
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// Newline-delimited JSON-RPC over a child process's stdin/stdout
pub struct StdioTransport {
    name: String,
    child: Mutex<Option<Child>>,
    stdin_tx: mpsc::Sender<String>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl StdioTransport {
    pub fn spawn(
        name: &str,
        config: &McpServerConfig,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("child has no stdout".to_string()))?;
        let stderr = child.stderr.take();

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(100);
        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(name.to_string(), stdin, stdin_rx));
        tokio::spawn(read_loop(
            name.to_string(),
            stdout,
            pending.clone(),
            connected.clone(),
        ));
        if let Some(stderr) = stderr {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, line = %line, "MCP server stderr");
                }
            });
        }

        tracing::info!(server = %name, command = %config.command, "MCP server spawned");

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin_tx,
            pending,
            connected,
            request_timeout,
        })
    }
}

async fn write_loop(
    server: String,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = stdin.write_all(msg.as_bytes()).await {
            tracing::error!(server = %server, error = %e, "Failed to write to MCP stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::error!(server = %server, error = %e, "Failed to flush MCP stdin");
            break;
        }
    }
}

async fn read_loop(
    server: String,
    stdout: tokio::process::ChildStdout,
    pending: Pending,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                // Notifications also parse as responses, just without an id
                match serde_json::from_str::<JsonRpcResponse>(line) {
                    Ok(response) if response.id.is_some() => {
                        let id = response.id.unwrap_or_default();
                        let waiter = lock(&pending).remove(&id);
                        if let Some(tx) = waiter {
                            let _ = tx.send(response);
                        }
                    }
                    _ => match serde_json::from_str::<JsonRpcNotification>(line) {
                        Ok(notification) => {
                            tracing::debug!(server = %server, method = %notification.method, "MCP notification");
                        }
                        Err(_) => tracing::warn!(server = %server, line = %line, "Unknown MCP message"),
                    },
                }
            }
            Ok(None) => {
                tracing::info!(server = %server, "MCP stdout closed");
                break;
            }
            Err(e) => {
                tracing::error!(server = %server, error = %e, "Failed to read MCP stdout");
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders fails every waiting request with Closed
    lock(&pending).clear();
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        if !self.is_connected() {
            return Err(McpError::Closed);
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        let _entry = PendingEntry::register(&self.pending, id, tx);

        let msg = serde_json::to_string(&request)? + "\n";
        if self.stdin_tx.send(msg).await.is_err() {
            return Err(McpError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                tracing::warn!(server = %self.name, id, "MCP request timed out");
                Err(McpError::Timeout(self.request_timeout))
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::Closed);
        }
        let msg = serde_json::to_string(&notification)? + "\n";
        self.stdin_tx.send(msg).await.map_err(|_| McpError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(server = %self.name, error = %e, "Failed to kill MCP server");
            }
        }
        lock(&self.pending).clear();
    }
}
