//! Provider trait definition.

use crate::error::ProviderError;
use crate::providers::ProviderKind;
use crate::types::{ChatRequest, Metrics, ModelInfo, StreamEvent, ToolCall};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Synchronous, in-order receiver of one invocation's events.
pub type EventSink<'a> = dyn FnMut(StreamEvent) + Send + 'a;

/// Trait for LLM provider implementations.
///
/// Providers handle communication with different LLM APIs and normalize
/// their streaming responses into [`StreamEvent`]s.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g., "anthropic", "openai").
    fn name(&self) -> &str;

    /// Wire-protocol family.
    fn kind(&self) -> ProviderKind;

    /// List of models known for this provider.
    fn models(&self) -> Vec<ModelInfo>;

    /// Whether `model` accepts image input. Images sent to other models are
    /// dropped.
    fn supports_vision(&self, model: &str) -> bool {
        self.models()
            .iter()
            .any(|m| m.id == model && m.supports_vision)
    }

    /// Stream one model turn into `sink`.
    ///
    /// Emits exactly one `Start`, then content events, then either a
    /// `Metrics` + `Done` pair or a single `Error`. Returns `Err` only for
    /// transport or protocol failures, and `Err(ProviderError::Cancelled)`
    /// without an `Error` event when `cancel` fires.
    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError>;

    /// Run [`Provider::chat`] and collect the whole turn.
    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let mut completion = Completion::default();
        let mut sink = |event: StreamEvent| completion.absorb(event);
        self.chat(request, cancel, &mut sink).await?;
        Ok(completion)
    }
}

/// A fully collected model turn.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCall>,
    pub metrics: Option<Metrics>,
}

impl Completion {
    fn absorb(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Delta { text } => self.text.push_str(&text),
            StreamEvent::Thinking { text } => self.thinking.push_str(&text),
            StreamEvent::ToolComplete {
                id,
                name,
                arguments,
            } => self.tool_calls.push(ToolCall {
                id,
                name,
                arguments: arguments.unwrap_or(serde_json::Value::Null),
            }),
            StreamEvent::Metrics(metrics) => self.metrics = Some(metrics),
            _ => {}
        }
    }
}

// Compile-time check: Provider must be object-safe
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};
