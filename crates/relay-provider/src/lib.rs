//! relay-provider: unified streaming over Anthropic, OpenAI, Ollama and llama.cpp.

mod error;
pub mod metrics;
pub mod providers;
pub mod schema;
pub mod stream;
pub mod traits;
pub mod types;

pub use error::ProviderError;
pub use providers::{
    anthropic::AnthropicProvider, llamacpp::LlamaCppProvider, ollama::OllamaProvider,
    openai::OpenAiProvider, AnyProvider, ProviderConfig, ProviderKind,
};
pub use traits::{Completion, EventSink, Provider};
pub use types::{
    Attachment, ChatRequest, Message, MessageId, Metrics, ModelInfo, Reasoning, ReasoningEffort, Role,
    SamplingOptions, StreamEvent, ToolCall, ToolDefinition, ToolResult, Usage,
};
