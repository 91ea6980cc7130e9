//! The tool catalog and invocation seam used by the orchestration loop.

use async_trait::async_trait;
use relay_mcp::{McpError, McpManager, McpToolCallResult};
use relay_provider::ToolDefinition;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Something that can list and run tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools to advertise to the model.
    async fn catalog(&self) -> Vec<ToolDefinition>;

    /// Run one tool call. Tool-reported failures come back as `is_error`
    /// results; `Err` means the call could not be carried out.
    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpToolCallResult, McpError>;
}

#[async_trait]
impl ToolExecutor for McpManager {
    async fn catalog(&self) -> Vec<ToolDefinition> {
        self.list_tools()
            .await
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect()
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpToolCallResult, McpError> {
        McpManager::invoke(self, name, arguments, cancel).await
    }
}

/// Executor with an empty catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    async fn catalog(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn invoke(
        &self,
        name: &str,
        _arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<McpToolCallResult, McpError> {
        Err(McpError::UnknownTool(name.to_string()))
    }
}
