//! OpenAI provider built on the chat completions transport.

use super::openai_compat::{convert_messages, convert_tools, ChatCompletionsDecoder, CompatTransport};
use super::{model, ProviderKind};
use crate::error::ProviderError;
use crate::metrics::prompt_chars;
use crate::traits::Provider;
use crate::types::{ChatRequest, ModelInfo, StreamEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Model families that accept image input.
const VISION_PREFIXES: &[&str] = &["gpt-4o", "gpt-4.1", "gpt-4-turbo", "gpt-5", "chatgpt-4o", "o1", "o3", "o4"];
const TEXT_ONLY: &[&str] = &["o1-mini", "o3-mini"];

/// OpenAI chat completions provider.
///
/// Set the `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    transport: CompatTransport,
    name: String,
    models: Option<Vec<ModelInfo>>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            transport: CompatTransport::new(OPENAI_BASE_URL, Some(api_key.into())),
            name: ProviderKind::OpenAi.as_str().to_string(),
            models: None,
        }
    }

    /// Point at a proxy or compatible gateway.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.transport.set_base_url(url.into());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.transport.client = client;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = Some(models);
        self
    }

    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let vision = self.supports_vision(&request.model);
        let messages = convert_messages(
            request.system.as_deref(),
            &request.messages,
            vision,
            &request.model,
        );

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(convert_tools(&request.tools));
        }

        let options = &request.options;
        if let Some(max_tokens) = options.max_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        }
        if options.wants_thinking() {
            // Reasoning models reject a custom temperature.
            let effort = options.reasoning_effort.map_or("medium", |e| e.level());
            body["reasoning_effort"] = json!(effort);
        } else if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(seed) = options.seed {
            body["seed"] = json!(seed);
        }
        if !options.stop.is_empty() {
            body["stop"] = json!(options.stop);
        }

        body
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn models(&self) -> Vec<ModelInfo> {
        if let Some(models) = &self.models {
            return models.clone();
        }
        vec![
            ModelInfo {
                supports_vision: true,
                ..model("gpt-4o", "GPT-4o", 128_000, 16_384)
            },
            ModelInfo {
                supports_vision: true,
                ..model("gpt-4o-mini", "GPT-4o mini", 128_000, 16_384)
            },
            ModelInfo {
                supports_vision: true,
                ..model("gpt-4.1", "GPT-4.1", 1_047_576, 32_768)
            },
            ModelInfo {
                supports_thinking: true,
                supports_vision: true,
                ..model("o4-mini", "o4-mini", 200_000, 100_000)
            },
            ModelInfo {
                supports_thinking: true,
                ..model("o3-mini", "o3-mini", 200_000, 100_000)
            },
        ]
    }

    fn supports_vision(&self, model: &str) -> bool {
        if let Some(info) = self.models().iter().find(|m| m.id == model) {
            return info.supports_vision;
        }
        VISION_PREFIXES.iter().any(|p| model.starts_with(p))
            && !TEXT_ONLY.iter().any(|p| model.starts_with(p))
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        let body = self.build_request_body(request);
        tracing::debug!(provider = %self.name, model = %request.model, "sending chat completions request");
        self.transport
            .stream(
                &body,
                prompt_chars(request),
                ChatCompletionsDecoder::new(),
                cancel,
                sink,
            )
            .await
    }
}
