//! MCP stdio client: spawns tool servers, discovers their tools and routes
//! calls to them.

mod config;
mod connection;
mod error;
mod manager;
mod protocol;
#[cfg(test)]
mod testing;

pub use config::McpServerConfig;
pub use connection::{ConnectionState, McpConnection};
pub use error::McpError;
pub use manager::{McpManager, ServerStatus};
pub use protocol::{McpToolCallResult, McpToolInfo, MCP_PROTOCOL_VERSION};
