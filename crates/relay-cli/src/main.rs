//! relay: unified LLM gateway with MCP tool calling.
//!
//! Prints one JSON record per event on stdout; logs go to stderr.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, ToolsAction};
use relay_core::ConfigStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("relay=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_store = match &cli.config {
        Some(path) => ConfigStore::at(path),
        None => ConfigStore::new(),
    };
    let mut config = config_store.load()?;
    ConfigStore::hydrate_env(&config);

    match cli.command {
        Commands::Chat {
            ref prompt,
            ref system,
            ref images,
            max_iterations,
            no_tools,
            ref sampling,
        } => {
            if no_tools {
                config.mcp_servers.clear();
            }
            if let Some(cap) = max_iterations {
                config.max_tool_iterations = cap;
            }
            let target = commands::resolve_target(&cli, &config);
            let request = commands::chat::build_request(
                &target.model,
                prompt,
                system.clone(),
                images,
                sampling.to_options(),
            )?;
            let gateway = commands::build_gateway(&config).await?;
            let result = commands::chat::run(&gateway, &target.provider, request).await;
            gateway.shutdown().await;
            result?;
        }
        Commands::Compare {
            ref prompt,
            ref targets,
            ref system,
            ref sampling,
        } => {
            config.mcp_servers.clear();
            let request = commands::chat::build_request(
                "",
                prompt,
                system.clone(),
                &[],
                sampling.to_options(),
            )?;
            let gateway = commands::build_gateway(&config).await?;
            commands::compare::run(&gateway, targets, request).await?;
        }
        Commands::Tools { ref action } => {
            let gateway = commands::build_gateway(&config).await?;
            let result = match action {
                ToolsAction::List => commands::tools::list(&gateway).await,
                ToolsAction::Status => commands::tools::status(&gateway).await,
            };
            gateway.shutdown().await;
            result?;
        }
    }

    Ok(())
}
