//! Fake stdio servers for tests.

use crate::config::McpServerConfig;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Answers `initialize` (id 1) and `tools/list` (id 2) with one `echo` tool.
pub(crate) const HANDSHAKE: &str = r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"1.0.0"}}}'
read -r line
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo input","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}'
"#;

/// Write an executable `/bin/sh` script into `dir`.
pub(crate) fn fake_server(dir: &TempDir, file: &str, body: &str) -> PathBuf {
    let path = dir.path().join(file);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
    }
    path
}

pub(crate) fn fake_config(name: &str, script: &Path) -> McpServerConfig {
    let mut config = McpServerConfig::new(name, script.display().to_string());
    config.startup_timeout_secs = 5;
    config
}
