//! One stdio MCP server subprocess.
//!
//! Requests are multiplexed: every request gets a fresh id and a one-shot
//! slot in the pending map, and a background reader routes each response
//! line to its slot. Callers never hold a lock while waiting for a reply.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::protocol::{self, Incoming, McpToolCallResult, McpToolInfo, RpcError};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Stopped,
    Starting,
    Initializing,
    Discovering,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Starting => "starting",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

type Reply = Result<Value, RpcError>;

/// State shared with the reader task.
struct Shared {
    server: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    state: Mutex<ConnectionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// `Stopped` is terminal.
    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state && *current != ConnectionState::Stopped {
            tracing::debug!(server = %self.server, from = %*current, to = %state, "mcp state change");
            *current = state;
        }
    }

    fn io_error(&self, err: std::io::Error) -> McpError {
        McpError::Io {
            server: self.server.clone(),
            message: err.to_string(),
        }
    }

    async fn write_message(&self, message: &Value) -> Result<(), McpError> {
        let mut payload = serde_json::to_vec(message).map_err(|err| McpError::Json {
            server: self.server.clone(),
            message: err.to_string(),
        })?;
        payload.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&payload)
            .await
            .map_err(|err| self.io_error(err))?;
        stdin.flush().await.map_err(|err| self.io_error(err))
    }

    fn dispatch(self: &Arc<Self>, message: Value) {
        match Incoming::classify(message) {
            Incoming::Response { id, outcome } => {
                let slot = lock(&self.pending).remove(&id);
                match slot {
                    Some(tx) => {
                        // The caller may have given up already.
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::debug!(server = %self.server, id, "dropping response for unknown request");
                    }
                }
            }
            Incoming::Request { id, method } => {
                tracing::debug!(server = %self.server, %method, "rejecting server-initiated request");
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let reply = protocol::method_not_found(id, &method);
                    if let Err(err) = shared.write_message(&reply).await {
                        tracing::debug!(server = %shared.server, error = %err, "failed to answer server request");
                    }
                });
            }
            Incoming::Notification { method } => {
                tracing::debug!(server = %self.server, %method, "mcp notification");
            }
            Incoming::Invalid => {
                tracing::debug!(server = %self.server, "ignoring message without id or method");
            }
        }
    }

    /// Open a reply slot for `id`. The state is checked after the insert, so
    /// a concurrent `close` either drains the slot or is seen here.
    fn register(&self, id: u64) -> Result<oneshot::Receiver<Reply>, McpError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.state() == ConnectionState::Stopped {
            lock(&self.pending).remove(&id);
            return Err(McpError::ConnectionClosed(self.server.clone()));
        }
        Ok(rx)
    }

    /// Mark the connection stopped and fail every waiter.
    fn close(&self) {
        self.set_state(ConnectionState::Stopped);
        let dropped = std::mem::take(&mut *lock(&self.pending));
        if !dropped.is_empty() {
            tracing::debug!(server = %self.server, pending = dropped.len(), "failing pending requests");
        }
    }
}

/// Removes a pending slot when the waiting request goes away.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

/// stdio-backed MCP connection.
pub struct McpConnection {
    shared: Arc<Shared>,
    child: Mutex<Child>,
    next_request_id: AtomicU64,
    tools: RwLock<Vec<McpToolInfo>>,
    reader: JoinHandle<()>,
}

impl McpConnection {
    /// Spawn the server, run the handshake and discover its tools.
    ///
    /// The handshake is bounded by the config's startup timeout. On any
    /// failure the subprocess is killed.
    pub async fn start(config: &McpServerConfig, base_cwd: &Path) -> Result<Self, McpError> {
        config.validate()?;
        let (mut child, stdin, stdout) = spawn(config, base_cwd)?;

        let shared = Arc::new(Shared {
            server: config.name.clone(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Starting),
        });
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(config.name.clone(), stderr));
        }
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), stdout));

        let connection = Self {
            shared,
            child: Mutex::new(child),
            next_request_id: AtomicU64::new(1),
            tools: RwLock::new(Vec::new()),
            reader,
        };

        let timeout = config.startup_timeout();
        let handshake = async {
            connection.initialize().await?;
            connection.shared.set_state(ConnectionState::Discovering);
            connection.discover().await
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(tools)) => {
                *connection.tools.write().unwrap_or_else(|p| p.into_inner()) = tools;
                connection.shared.set_state(ConnectionState::Ready);
                if !connection.is_ready() {
                    return Err(McpError::ConnectionClosed(config.name.clone()));
                }
                Ok(connection)
            }
            Ok(Err(err)) => {
                connection.shutdown().await;
                Err(err)
            }
            Err(_) => {
                connection.shutdown().await;
                Err(McpError::Timeout {
                    server: config.name.clone(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.server
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Tools discovered at startup or by the last refresh.
    pub fn tools(&self) -> Vec<McpToolInfo> {
        self.tools.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|tool| tool.name == name)
    }

    /// Requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Call one tool. A tool-reported failure is an `is_error` result, not an
    /// `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpToolCallResult, McpError> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let result = self
            .request(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments,
                }),
                cancel,
            )
            .await?;
        Ok(protocol::parse_call_result(&result))
    }

    /// Re-run discovery and replace the catalog.
    pub async fn refresh_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        if !self.is_ready() {
            return Err(McpError::ConnectionClosed(self.shared.server.clone()));
        }
        let tools = self.discover().await?;
        *self.tools.write().unwrap_or_else(|p| p.into_inner()) = tools.clone();
        Ok(tools)
    }

    /// Kill the subprocess and fail everything in flight.
    pub async fn shutdown(&self) {
        self.reader.abort();
        let child = {
            let mut child = lock(&self.child);
            if let Err(err) = child.start_kill() {
                tracing::debug!(server = %self.shared.server, error = %err, "kill failed");
            }
            child.id()
        };
        self.shared.close();
        tracing::debug!(server = %self.shared.server, pid = ?child, "mcp server stopped");
    }

    async fn initialize(&self) -> Result<(), McpError> {
        self.shared.set_state(ConnectionState::Initializing);
        let never = CancellationToken::new();
        self.request("initialize", protocol::initialize_params(), &never)
            .await?;
        self.shared
            .write_message(&protocol::notification(
                "notifications/initialized",
                json!({}),
            ))
            .await
    }

    async fn discover(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let never = CancellationToken::new();
        let server = &self.shared.server;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request("tools/list", params, &never).await?;
            let listed = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| McpError::InvalidResponse {
                    server: server.clone(),
                    message: "tools/list result missing tools array".to_string(),
                })?;

            for tool in listed {
                tools.push(protocol::parse_tool_info(server, tool)?);
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            if cursor.is_none() {
                break;
            }
        }
        tracing::debug!(server = %server, tools = tools.len(), "discovered tools");
        Ok(tools)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        let server = &self.shared.server;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.shared.register(id)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        self.shared
            .write_message(&protocol::request(id, method, params))
            .await?;

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(server = %server, id, method, "mcp request cancelled");
                return Err(McpError::Cancelled);
            }
            reply = rx => reply,
        };

        match reply {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(McpError::ServerError {
                server: server.clone(),
                code: err.code,
                message: err.message,
            }),
            Err(_) => Err(McpError::ConnectionClosed(server.clone())),
        }
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        if let Ok(mut child) = self.child.lock() {
            let _ = child.start_kill();
        }
    }
}

fn spawn(
    config: &McpServerConfig,
    base_cwd: &Path,
) -> Result<(Child, ChildStdin, ChildStdout), McpError> {
    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(&config.env)
        .current_dir(config.resolve_cwd(base_cwd))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| McpError::Spawn {
        server: config.name.clone(),
        message: err.to_string(),
    })?;
    let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
        server: config.name.clone(),
        message: "child stdin was not piped".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
        server: config.name.clone(),
        message: "child stdout was not piped".to_string(),
    })?;
    Ok((child, stdin, stdout))
}

async fn read_loop(shared: Arc<Shared>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => shared.dispatch(message),
                    Err(err) => {
                        tracing::debug!(server = %shared.server, error = %err, "skipping non-JSON stdout line");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(server = %shared.server, error = %err, "failed to read mcp stdout");
                break;
            }
        }
    }
    tracing::debug!(server = %shared.server, "mcp stdout closed");
    shared.close();
}

async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut stderr = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match stderr.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                tracing::debug!(server = %server, stderr = line.trim_end(), "mcp stderr");
            }
            Err(err) => {
                tracing::debug!(server = %server, error = %err, "failed to read mcp stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_server, fake_config, HANDSHAKE};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_and_call() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(
            &dir,
            "echo.sh",
            &format!(
                "{HANDSHAKE}{}",
                r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}],"structuredContent":{"ok":true},"isError":false}}'
cat >/dev/null
"#
            ),
        );
        let conn = McpConnection::start(&fake_config("fake", &script), dir.path())
            .await
            .unwrap();
        assert!(conn.is_ready());
        assert!(conn.has_tool("echo"));
        assert_eq!(conn.tools()[0].server, "fake");

        let result = conn
            .call_tool("echo", json!({"text": "ping"}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text, "pong");
        assert_eq!(result.structured_content, Some(json!({"ok": true})));
        assert_eq!(conn.pending_requests(), 0);
        conn.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_reordered_responses_reach_their_callers() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(
            &dir,
            "reorder.sh",
            &format!(
                "{HANDSHAKE}{}",
                r#"read -r first
read -r second
id1=$(printf '%s' "$first" | sed 's/.*"id":\([0-9]*\).*/\1/')
text1=$(printf '%s' "$first" | sed 's/.*"text":"\([^"]*\)".*/\1/')
id2=$(printf '%s' "$second" | sed 's/.*"id":\([0-9]*\).*/\1/')
text2=$(printf '%s' "$second" | sed 's/.*"text":"\([^"]*\)".*/\1/')
printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echo:%s"}]}}\n' "$id2" "$text2"
printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echo:%s"}]}}\n' "$id1" "$text1"
cat >/dev/null
"#
            ),
        );
        let conn = McpConnection::start(&fake_config("fake", &script), dir.path())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            conn.call_tool("echo", json!({"text": "alpha"}), &cancel),
            conn.call_tool("echo", json!({"text": "beta"}), &cancel),
        );
        assert_eq!(a.unwrap().text, "echo:alpha");
        assert_eq!(b.unwrap().text, "echo:beta");
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_leaves_no_pending_slot() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(&dir, "silent.sh", &format!("{HANDSHAKE}cat >/dev/null\n"));
        let conn = McpConnection::start(&fake_config("fake", &script), dir.path())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = conn.call_tool("echo", json!({"text": "x"}), &cancel).await;
        assert!(matches!(result, Err(McpError::Cancelled)));
        assert_eq!(conn.pending_requests(), 0);
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn test_calls_after_reader_closes_fail_fast() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(&dir, "silent.sh", &format!("{HANDSHAKE}cat >/dev/null\n"));
        let conn = McpConnection::start(&fake_config("fake", &script), dir.path())
            .await
            .unwrap();

        // A slot opened before the reader drains is failed by the drain.
        let early = conn.shared.register(99).unwrap();
        conn.shared.close();
        assert!(early.await.is_err());

        // One opened after the drain is refused instead of waiting forever.
        assert!(matches!(
            conn.shared.register(100),
            Err(McpError::ConnectionClosed(_))
        ));
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            conn.call_tool("echo", json!({"text": "x"}), &CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(McpError::ConnectionClosed(_))));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_tool_error_is_a_result() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(
            &dir,
            "fails.sh",
            &format!(
                "{HANDSHAKE}{}",
                r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"file not found"}],"isError":true}}'
cat >/dev/null
"#
            ),
        );
        let conn = McpConnection::start(&fake_config("fake", &script), dir.path())
            .await
            .unwrap();
        let result = conn
            .call_tool("echo", json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text, "file not found");
    }

    #[tokio::test]
    async fn test_server_request_gets_method_not_found() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(
            &dir,
            "asks.sh",
            &format!(
                "{HANDSHAKE}{}",
                r#"read -r call
printf '%s\n' '{"jsonrpc":"2.0","id":"srv-1","method":"roots/list","params":{}}'
read -r reply
code=$(printf '%s' "$reply" | sed 's/.*"code":\(-*[0-9]*\).*/\1/')
printf '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"code:%s"}]}}\n' "$code"
cat >/dev/null
"#
            ),
        );
        let conn = McpConnection::start(&fake_config("fake", &script), dir.path())
            .await
            .unwrap();
        let result = conn
            .call_tool("echo", json!({"text": "hi"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "code:-32601");
    }

    #[tokio::test]
    async fn test_paginated_discovery() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(
            &dir,
            "paged.sh",
            r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}}}}'
read -r line
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"one"}],"nextCursor":"page-2"}}'
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"two"}]}}'
cat >/dev/null
"#,
        );
        let conn = McpConnection::start(&fake_config("paged", &script), dir.path())
            .await
            .unwrap();
        let names: Vec<String> = conn.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_server_exit_during_handshake_fails_start() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(&dir, "dies.sh", "read -r line\nexit 1\n");
        let result = McpConnection::start(&fake_config("dies", &script), dir.path()).await;
        assert!(matches!(result, Err(McpError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(&dir, "mute.sh", "cat >/dev/null\n");
        let mut config = fake_config("mute", &script);
        config.startup_timeout_secs = 1;
        let result = McpConnection::start(&config, dir.path()).await;
        assert!(matches!(result, Err(McpError::Timeout { seconds: 1, .. })));
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let config = McpServerConfig::new("ghost", "/nonexistent/relay-test-server");
        let result = McpConnection::start(&config, dir.path()).await;
        assert!(matches!(result, Err(McpError::Spawn { .. })));
    }
}
