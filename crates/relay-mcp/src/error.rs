/// Errors returned by the MCP client.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP server '{0}' closed the stdio connection")]
    ConnectionClosed(String),
    #[error("MCP server '{server}' returned protocol error {code}: {message}")]
    ServerError {
        server: String,
        code: i64,
        message: String,
    },
    #[error("MCP server '{server}' sent invalid response: {message}")]
    InvalidResponse { server: String, message: String },
    #[error("MCP server '{server}' did not finish starting within {seconds}s")]
    Timeout { server: String, seconds: u64 },
    #[error("Failed to spawn MCP server '{server}': {message}")]
    Spawn { server: String, message: String },
    #[error("IO error while talking to MCP server '{server}': {message}")]
    Io { server: String, message: String },
    #[error("JSON error while talking to MCP server '{server}': {message}")]
    Json { server: String, message: String },
    #[error("No running MCP server provides tool '{0}'")]
    UnknownTool(String),
    #[error("MCP server '{0}' is already running")]
    AlreadyRunning(String),
    #[error("MCP server '{0}' is not running")]
    NotFound(String),
    #[error("Invalid MCP server config: {0}")]
    InvalidConfig(String),
    #[error("MCP request cancelled")]
    Cancelled,
}

impl McpError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, McpError::Cancelled)
    }
}
