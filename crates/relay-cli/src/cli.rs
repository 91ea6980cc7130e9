//! CLI argument and command definitions.

use clap::{Args, Parser, Subcommand};
use relay_core::CompareTarget;
use relay_provider::{ReasoningEffort, SamplingOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay", version, about = "Unified LLM gateway with MCP tool calling")]
pub struct Cli {
    /// Provider to use (defaults to the config's default provider).
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Model to use (defaults to the config's default model).
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Config file to read instead of ~/.relay/config.json.
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one prompt through the tool-calling loop, printing events as JSON lines.
    Chat {
        /// The prompt to send.
        prompt: String,

        /// System prompt.
        #[arg(long)]
        system: Option<String>,

        /// Attach an image file. May be repeated.
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        /// Tool-calling iteration cap (1-50).
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Do not start any MCP servers.
        #[arg(long)]
        no_tools: bool,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Send one prompt to several targets concurrently, without tools.
    Compare {
        /// The prompt to send.
        prompt: String,

        /// A `provider:model` pair. May be repeated.
        #[arg(long = "target", required = true)]
        targets: Vec<CompareTarget>,

        /// System prompt.
        #[arg(long)]
        system: Option<String>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Inspect configured MCP tool servers.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
}

#[derive(Subcommand)]
pub enum ToolsAction {
    /// List the aggregated tool catalog.
    List,
    /// Show the state of each tool server.
    Status,
}

#[derive(Args, Debug, Default)]
pub struct SamplingArgs {
    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub top_k: Option<u32>,

    #[arg(long)]
    pub seed: Option<i64>,

    /// Stop sequence. May be repeated.
    #[arg(long)]
    pub stop: Vec<String>,

    /// Ask the model to think before answering.
    #[arg(long)]
    pub thinking: bool,

    /// `low`, `medium`, `high` or a token budget.
    #[arg(long)]
    pub reasoning_effort: Option<ReasoningEffort>,

    /// GBNF grammar (llama.cpp only).
    #[arg(long)]
    pub grammar: Option<String>,
}

impl SamplingArgs {
    pub fn to_options(&self) -> SamplingOptions {
        SamplingOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            top_k: self.top_k,
            seed: self.seed,
            stop: self.stop.clone(),
            thinking: self.thinking.then_some(true),
            reasoning_effort: self.reasoning_effort,
            grammar: self.grammar.clone(),
        }
    }
}
