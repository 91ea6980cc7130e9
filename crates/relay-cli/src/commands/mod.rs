//! Command implementations.

pub mod chat;
pub mod compare;
pub mod tools;

use crate::cli::Cli;
use relay_core::{CompareTarget, Config, Gateway};
use serde::Serialize;
use std::io::Write;

pub async fn build_gateway(config: &Config) -> anyhow::Result<Gateway> {
    Gateway::from_config(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))
}

/// Provider and model from the command line, falling back to the config.
pub fn resolve_target(cli: &Cli, config: &Config) -> CompareTarget {
    CompareTarget::new(
        cli.provider
            .clone()
            .unwrap_or_else(|| config.default_provider.clone()),
        cli.model
            .clone()
            .unwrap_or_else(|| config.default_model.clone()),
    )
}

/// Write one JSON record per line to stdout.
pub fn print_json(record: &impl Serialize) -> anyhow::Result<()> {
    let line = serde_json::to_string(record)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_resolve_target_prefers_flags() {
        let config = Config::default();
        let cli = Cli::try_parse_from(["relay", "tools", "list"]).unwrap();
        let target = resolve_target(&cli, &config);
        assert_eq!(target.provider, config.default_provider);
        assert_eq!(target.model, config.default_model);

        let cli = Cli::try_parse_from(["relay", "--provider", "ollama", "--model", "qwen3", "tools", "list"])
            .unwrap();
        assert_eq!(resolve_target(&cli, &config), CompareTarget::new("ollama", "qwen3"));
    }
}
