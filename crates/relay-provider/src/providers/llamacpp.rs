//! llama.cpp server provider.
//!
//! Talks to `llama-server`'s OpenAI-compatible endpoint. The server hosts a
//! single model, resends reasoning as snapshots, and reports token counts in
//! a `timings` object when `usage` is missing.

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

const DEFAULT_BASE_URL: &str = "http://localhost:8080/v1";
const DEFAULT_MAX_TOKENS: u32 = 4_096;
const DEFAULT_THINKING_MAX_TOKENS: u32 = 16_384;

/// Provider for a local llama.cpp server.
pub struct LlamaCppProvider {
    transport: CompatTransport,
    name: String,
    vision: bool,
    models: Option<Vec<ModelInfo>>,
}

impl Default for LlamaCppProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaCppProvider {
    pub fn new() -> Self {
        Self {
            transport: CompatTransport::new(DEFAULT_BASE_URL, None),
            name: ProviderKind::LlamaCpp.as_str().to_string(),
            vision: false,
            models: None,
        }
    }

    /// Server root, e.g. `http://gpu-box:8080`. The `/v1` suffix is added.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        let url = url.trim_end_matches('/');
        let url = if url.ends_with("/v1") {
            url.to_string()
        } else {
            format!("{url}/v1")
        };
        self.transport.set_base_url(url);
        self
    }

    /// Key configured with `llama-server --api-key`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.transport.api_key = Some(key.into());
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

    /// Whether the server was started with a multimodal projector.
    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = Some(models);
        self
    }

    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let messages = convert_messages(
            request.system.as_deref(),
            &request.messages,
            self.vision,
            &request.model,
        );
        let options = &request.options;
        let thinking = options.wants_thinking();
        let max_tokens = options.max_tokens.unwrap_or(if thinking {
            DEFAULT_THINKING_MAX_TOKENS
        } else {
            DEFAULT_MAX_TOKENS
        });

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": max_tokens,
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(convert_tools(&request.tools));
        }
        if options.thinking.is_some() || options.reasoning_effort.is_some() {
            body["chat_template_kwargs"] = json!({"enable_thinking": thinking});
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = options.top_k {
            body["top_k"] = json!(top_k);
        }
        if let Some(seed) = options.seed {
            body["seed"] = json!(seed);
        }
        if !options.stop.is_empty() {
            body["stop"] = json!(options.stop);
        }
        if let Some(grammar) = &options.grammar {
            body["grammar"] = json!(grammar);
        }

        body
    }
}

#[async_trait]
impl Provider for LlamaCppProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LlamaCpp
    }

    fn models(&self) -> Vec<ModelInfo> {
        if let Some(models) = &self.models {
            return models.clone();
        }
        vec![ModelInfo {
            supports_thinking: true,
            supports_vision: self.vision,
            ..model("default", "llama.cpp server model", 32_768, 16_384)
        }]
    }

    /// The loaded projector decides vision for every model name.
    fn supports_vision(&self, _model: &str) -> bool {
        self.vision
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        let body = self.build_request_body(request);
        tracing::debug!(provider = %self.name, model = %request.model, "sending llama.cpp request");
        self.transport
            .stream(
                &body,
                prompt_chars(request),
                ChatCompletionsDecoder::new().with_reasoning_snapshots(),
                cancel,
                sink,
            )
            .await
    }
}
