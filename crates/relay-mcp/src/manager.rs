//! Registry of running tool servers and the aggregated tool catalog.

use crate::config::McpServerConfig;
use crate::connection::{ConnectionState, McpConnection};
use crate::error::McpError;
use crate::protocol::{McpToolCallResult, McpToolInfo};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub tool_count: usize,
    pub pending_requests: usize,
}

/// Owns every tool server connection.
///
/// Servers are kept in start order; when two servers expose the same tool
/// name the one started first wins.
pub struct McpManager {
    base_cwd: PathBuf,
    servers: RwLock<Vec<Arc<McpConnection>>>,
}

impl McpManager {
    /// Relative server working directories resolve against `base_cwd`.
    pub fn new(base_cwd: impl Into<PathBuf>) -> Self {
        Self {
            base_cwd: base_cwd.into(),
            servers: RwLock::new(Vec::new()),
        }
    }

    /// Start one server and register it once it is ready.
    ///
    /// Nothing is registered when startup fails.
    pub async fn start_server(&self, config: &McpServerConfig) -> Result<Vec<McpToolInfo>, McpError> {
        if self.find(&config.name).await.is_some() {
            return Err(McpError::AlreadyRunning(config.name.clone()));
        }

        tracing::debug!(server = %config.name, command = %config.command, "starting mcp server");
        let connection = Arc::new(McpConnection::start(config, &self.base_cwd).await?);
        let tools = connection.tools();

        let mut servers = self.servers.write().await;
        if servers.iter().any(|s| s.name() == config.name) {
            connection.shutdown().await;
            return Err(McpError::AlreadyRunning(config.name.clone()));
        }
        for tool in &tools {
            if let Some(owner) = servers.iter().find(|s| s.has_tool(&tool.name)) {
                tracing::warn!(
                    tool = %tool.name,
                    server = %config.name,
                    owner = %owner.name(),
                    "duplicate tool name; keeping the earlier server's tool"
                );
            }
        }
        tracing::info!(server = %config.name, tools = tools.len(), "mcp server ready");
        servers.push(connection);
        Ok(tools)
    }

    /// Start every enabled server, returning the ones that failed.
    pub async fn start_all(&self, configs: &[McpServerConfig]) -> Vec<(String, McpError)> {
        let mut failures = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            if let Err(err) = self.start_server(config).await {
                tracing::warn!(server = %config.name, error = %err, "mcp server failed to start");
                failures.push((config.name.clone(), err));
            }
        }
        failures
    }

    pub async fn stop_server(&self, name: &str) -> Result<(), McpError> {
        let connection = {
            let mut servers = self.servers.write().await;
            let index = servers
                .iter()
                .position(|s| s.name() == name)
                .ok_or_else(|| McpError::NotFound(name.to_string()))?;
            servers.remove(index)
        };
        connection.shutdown().await;
        tracing::info!(server = %name, "mcp server stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let servers = std::mem::take(&mut *self.servers.write().await);
        for connection in servers {
            connection.shutdown().await;
        }
    }

    /// Aggregated catalog of ready servers, shadowed duplicates excluded.
    pub async fn list_tools(&self) -> Vec<McpToolInfo> {
        let servers = self.servers.read().await;
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for connection in servers.iter().filter(|s| s.is_ready()) {
            for tool in connection.tools() {
                if seen.insert(tool.name.clone()) {
                    tools.push(tool);
                }
            }
        }
        tools
    }

    /// Invoke `name` on the server that owns it.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpToolCallResult, McpError> {
        let connection = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .find(|s| s.is_ready() && s.has_tool(name))
                .cloned()
        }
        .ok_or_else(|| McpError::UnknownTool(name.to_string()))?;

        tracing::debug!(server = %connection.name(), tool = name, "invoking mcp tool");
        connection.call_tool(name, arguments, cancel).await
    }

    pub async fn status(&self) -> Vec<ServerStatus> {
        self.servers
            .read()
            .await
            .iter()
            .map(|s| {
                let state = s.state();
                ServerStatus {
                    name: s.name().to_string(),
                    state,
                    connected: state != ConnectionState::Stopped,
                    tool_count: s.tools().len(),
                    pending_requests: s.pending_requests(),
                }
            })
            .collect()
    }

    /// Re-run tool discovery for one server.
    pub async fn refresh_tools(&self, name: &str) -> Result<Vec<McpToolInfo>, McpError> {
        let connection = self
            .find(name)
            .await
            .ok_or_else(|| McpError::NotFound(name.to_string()))?;
        connection.refresh_tools().await
    }

    async fn find(&self, name: &str) -> Option<Arc<McpConnection>> {
        self.servers
            .read()
            .await
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_config, fake_server, HANDSHAKE};
    use serde_json::json;
    use tempfile::TempDir;

    /// Answers every `tools/call` with `from:<server name>`.
    fn answering_server(dir: &TempDir, file: &str) -> PathBuf {
        fake_server(
            dir,
            file,
            &format!(
                "{HANDSHAKE}{}",
                r#"while read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"from:%s"}]}}\n' "$id" "$1"
done
"#
            ),
        )
    }

    fn config_with_arg(name: &str, script: &std::path::Path) -> McpServerConfig {
        let mut config = fake_config(name, script);
        config.args = vec![name.to_string()];
        config
    }

    #[tokio::test]
    async fn test_first_started_server_wins_duplicates() {
        let dir = TempDir::new().unwrap();
        let script = answering_server(&dir, "srv.sh");
        let manager = McpManager::new(dir.path());
        manager.start_server(&config_with_arg("alpha", &script)).await.unwrap();
        manager.start_server(&config_with_arg("beta", &script)).await.unwrap();

        let tools = manager.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server, "alpha");

        let result = manager
            .invoke("echo", json!({"text": "x"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from:alpha");

        manager.stop_server("alpha").await.unwrap();
        let result = manager
            .invoke("echo", json!({"text": "x"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from:beta");
        manager.stop_all().await;
        assert!(manager.status().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_registers_nothing() {
        let dir = TempDir::new().unwrap();
        let script = fake_server(&dir, "dies.sh", "exit 3\n");
        let manager = McpManager::new(dir.path());
        let err = manager.start_server(&fake_config("dies", &script)).await;
        assert!(err.is_err());
        assert!(manager.status().await.is_empty());
        assert!(manager.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_server_name_rejected() {
        let dir = TempDir::new().unwrap();
        let script = answering_server(&dir, "srv.sh");
        let manager = McpManager::new(dir.path());
        manager.start_server(&config_with_arg("one", &script)).await.unwrap();
        let again = manager.start_server(&config_with_arg("one", &script)).await;
        assert!(matches!(again, Err(McpError::AlreadyRunning(_))));
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_unknown_tool_and_missing_server() {
        let dir = TempDir::new().unwrap();
        let manager = McpManager::new(dir.path());
        let result = manager
            .invoke("nope", json!({}), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(McpError::UnknownTool(_))));
        assert!(matches!(
            manager.stop_server("ghost").await,
            Err(McpError::NotFound(_))
        ));
        assert!(matches!(
            manager.refresh_tools("ghost").await,
            Err(McpError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_all_skips_disabled_and_reports_failures() {
        let dir = TempDir::new().unwrap();
        let good = answering_server(&dir, "good.sh");
        let mut disabled = config_with_arg("off", &good);
        disabled.enabled = false;
        let broken = McpServerConfig::new("broken", "/nonexistent/relay-mcp-server");

        let manager = McpManager::new(dir.path());
        let failures = manager
            .start_all(&[config_with_arg("good", &good), disabled, broken])
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");

        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "good");
        assert_eq!(status[0].state, ConnectionState::Ready);
        assert!(status[0].connected);
        assert_eq!(status[0].tool_count, 1);
        assert_eq!(status[0].pending_requests, 0);
        manager.stop_all().await;
    }
}
