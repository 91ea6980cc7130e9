//! Tool server configuration.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

/// Config for a stdio MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    /// Unique server name.
    pub name: String,
    /// Whether this server should be started with the gateway.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Executable to spawn.
    pub command: String,
    /// Optional command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional environment overrides for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Optional working directory override for the server process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Bound on the initialize + discovery handshake, in seconds.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Reject names outside `[A-Za-z0-9_-]` and empty commands.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.is_empty() || !is_valid_name(&self.name) {
            return Err(McpError::InvalidConfig(format!(
                "invalid server name '{}'",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(McpError::InvalidConfig(format!(
                "server '{}' is missing a command",
                self.name
            )));
        }
        Ok(())
    }

    /// Working directory for the subprocess, relative paths resolved
    /// against `base`.
    pub fn resolve_cwd(&self, base: &Path) -> PathBuf {
        match self.cwd.as_deref() {
            Some(cwd) if !cwd.trim().is_empty() => {
                let path = Path::new(cwd);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    base.join(path)
                }
            }
            _ => base.to_path_buf(),
        }
    }
}

fn is_valid_name(input: &str) -> bool {
    input
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}
