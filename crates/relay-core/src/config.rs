use crate::error::RelayError;
use crate::orchestrator::DEFAULT_MAX_ITERATIONS;
use relay_mcp::McpServerConfig;
use relay_provider::{ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Serialized settings from ~/.relay/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry name of the provider used when none is given.
    pub default_provider: String,
    pub default_model: String,
    /// Keys by provider kind, exported as `<PROVIDER>_API_KEY`.
    pub api_keys: HashMap<String, String>,
    pub providers: Vec<ProviderConfig>,
    pub mcp_servers: Vec<McpServerConfig>,
    /// Tool-calling iteration cap per chat.
    pub max_tool_iterations: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: "anthropic".to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
            api_keys: HashMap::new(),
            providers: [
                ProviderKind::Anthropic,
                ProviderKind::OpenAi,
                ProviderKind::Ollama,
                ProviderKind::LlamaCpp,
            ]
            .into_iter()
            .map(ProviderConfig::new)
            .collect(),
            mcp_servers: Vec::new(),
            max_tool_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl Config {
    /// Reject settings that deserialize but cannot be used.
    pub fn validate(&self) -> Result<(), RelayError> {
        let mut providers = HashSet::new();
        for provider in &self.providers {
            let name = provider.registry_name();
            if !providers.insert(name.clone()) {
                return Err(RelayError::Config(format!("duplicate provider '{name}'")));
            }
        }

        let mut servers = HashSet::new();
        for server in &self.mcp_servers {
            server
                .validate()
                .map_err(|e| RelayError::Config(e.to_string()))?;
            if !servers.insert(server.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate mcp server '{}'",
                    server.name
                )));
            }
        }
        Ok(())
    }
}

/// Helper struct for storing the location to read/write global settings
pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".relay");
        path.push("config.json");
        Self { path }
    }

    /// Store rooted at an explicit file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the user's saved config. A missing file yields the defaults.
    pub fn load(&self) -> Result<Config, RelayError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(err) => return Err(err.into()),
        };
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the user's config back to disk
    pub fn save(&self, config: &Config) -> Result<(), RelayError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    /// Export configured API keys as `<PROVIDER>_API_KEY` without overwriting
    /// the process environment.
    pub fn hydrate_env(config: &Config) {
        for (provider, key) in config.api_keys.iter() {
            if !key.is_empty() {
                let env_var = format!("{}_API_KEY", provider.to_uppercase());
                if std::env::var(&env_var).is_err() {
                    std::env::set_var(&env_var, key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_partial_file_uses_defaults() {
        let partial = r#"{
            "default_provider":"ollama",
            "api_keys":{"anthropic":"k"}
        }"#;

        let parsed: Config = serde_json::from_str(partial).unwrap();
        assert_eq!(parsed.default_provider, "ollama");
        assert_eq!(parsed.providers.len(), 4);
        assert!(parsed.mcp_servers.is_empty());
        assert_eq!(parsed.max_tool_iterations, DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn test_store_round_trip_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::at(dir.path().join("nested").join("config.json"));
        assert_eq!(store.load().unwrap().default_provider, "anthropic");

        let mut cfg = Config::default();
        cfg.default_provider = "local".to_string();
        let mut llama = ProviderConfig::new(ProviderKind::LlamaCpp);
        llama.name = Some("local".to_string());
        llama.base_url = Some("http://127.0.0.1:9000".to_string());
        cfg.providers.push(llama);
        let mut server = McpServerConfig::new("filesystem", "npx");
        server.args = vec![
            "-y".to_string(),
            "@modelcontextprotocol/server-filesystem".to_string(),
        ];
        cfg.mcp_servers.push(server);
        store.save(&cfg).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.default_provider, "local");
        assert_eq!(loaded.providers.len(), 5);
        assert_eq!(loaded.mcp_servers[0].args.len(), 2);
        assert!(loaded.mcp_servers[0].enabled);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut cfg = Config::default();
        cfg.providers.push(ProviderConfig::new(ProviderKind::Ollama));
        assert!(matches!(cfg.validate(), Err(RelayError::Config(_))));

        let mut cfg = Config::default();
        cfg.mcp_servers.push(McpServerConfig::new("fs", "a"));
        cfg.mcp_servers.push(McpServerConfig::new("fs", "b"));
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.mcp_servers.push(McpServerConfig::new("bad name", "a"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ConfigStore::at(path).load(),
            Err(RelayError::Serialization(_))
        ));
    }

    #[test]
    fn test_hydrate_env_keeps_existing_values() {
        std::env::set_var("RELAYTESTKIND_API_KEY", "from-env");
        let mut cfg = Config::default();
        cfg.api_keys
            .insert("relaytestkind".to_string(), "from-config".to_string());
        cfg.api_keys
            .insert("relaytestother".to_string(), "other".to_string());
        ConfigStore::hydrate_env(&cfg);
        assert_eq!(std::env::var("RELAYTESTKIND_API_KEY").unwrap(), "from-env");
        assert_eq!(std::env::var("RELAYTESTOTHER_API_KEY").unwrap(), "other");
    }
}
