//! Anthropic Claude provider implementation.
//!
//! Implements the Provider trait for Anthropic's Messages API with SSE streaming.

use super::{model, usable_images, ProviderKind};
use crate::error::ProviderError;
use crate::metrics::prompt_chars;
use crate::schema::normalize_schema;
use crate::stream::{pump, sse_payloads, Emitter, StreamDecoder, ToolCallAccumulator};
use crate::traits::Provider;
use crate::types::{
    ChatRequest, Message, ModelInfo, ReasoningEffort, Role, StreamEvent, ToolDefinition, Usage,
};
use async_trait::async_trait;
use reqwest::Client;
use reqwest_eventsource::EventSource;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8_192;

const LOW_BUDGET: u32 = 4_096;
const MEDIUM_BUDGET: u32 = 10_000;
const HIGH_BUDGET: u32 = 32_000;
const MIN_BUDGET: u32 = 1_024;
/// Room left for the answer on top of the thinking budget.
const ANSWER_HEADROOM: u32 = 4_096;

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    name: String,
    models: Option<Vec<ModelInfo>>,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: API_BASE.to_string(),
            name: ProviderKind::Anthropic.as_str().to_string(),
            models: None,
        }
    }

    /// Create with a custom base URL (for testing/proxy).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the built-in model catalog.
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = Some(models);
        self
    }

    /// Convert a ChatRequest into the Anthropic API request body.
    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let vision = self.supports_vision(&request.model);
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter_map(|msg| self.convert_message(msg, vision, &request.model))
            .collect();

        let options = &request.options;
        let thinking = options.wants_thinking();
        let budget = thinking_budget(options.reasoning_effort);
        let mut max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if thinking && max_tokens <= budget {
            max_tokens = budget + ANSWER_HEADROOM;
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| self.convert_tool(t))
                .collect::<Vec<_>>());
        }

        // System messages in the history join the system prompt.
        let system: Vec<&str> = request
            .system
            .as_deref()
            .into_iter()
            .chain(
                request
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.as_str()),
            )
            .filter(|s| !s.is_empty())
            .collect();
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }

        if thinking {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": budget,
            });
        } else {
            if let Some(temperature) = options.temperature {
                body["temperature"] = json!(temperature);
            }
            if let Some(top_k) = options.top_k {
                body["top_k"] = json!(top_k);
            }
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if !options.stop.is_empty() {
            body["stop_sequences"] = json!(options.stop);
        }

        body
    }

    /// Convert a Message to the Anthropic JSON format.
    fn convert_message(&self, msg: &Message, vision: bool, model: &str) -> Option<Value> {
        // Anthropic only accepts "user" and "assistant" roles in messages
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => return None,
        };

        let mut content = Vec::new();
        // With thinking enabled the API requires the signed thinking block
        // ahead of the tool_use blocks it produced.
        if let (Role::Assistant, Some(reasoning)) = (msg.role, &msg.reasoning) {
            if !msg.tool_calls.is_empty() {
                content.push(json!({
                    "type": "thinking",
                    "thinking": reasoning.text,
                    "signature": reasoning.signature,
                }));
            }
        }
        for result in &msg.tool_results {
            content.push(json!({
                "type": "tool_result",
                "tool_use_id": result.tool_call_id,
                "content": result.content,
                "is_error": result.is_error,
            }));
        }
        if msg.role == Role::User {
            for image in usable_images(msg, vision, model) {
                content.push(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": image.mime_type,
                        "data": image.data,
                    },
                }));
            }
        }
        if !msg.content.is_empty() {
            content.push(json!({
                "type": "text",
                "text": msg.content,
            }));
        }
        for call in &msg.tool_calls {
            let input = match &call.arguments {
                Value::Object(_) => call.arguments.clone(),
                _ => json!({}),
            };
            content.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": input,
            }));
        }

        if content.is_empty() {
            return None;
        }

        Some(json!({
            "role": role,
            "content": content,
        }))
    }

    /// Convert a ToolDefinition to Anthropic format.
    fn convert_tool(&self, tool: &ToolDefinition) -> Value {
        json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": normalize_schema(&tool.input_schema),
        })
    }
}

/// Thinking budget for a requested effort.
pub(crate) fn thinking_budget(effort: Option<ReasoningEffort>) -> u32 {
    match effort {
        Some(ReasoningEffort::Low) => LOW_BUDGET,
        Some(ReasoningEffort::Medium) | None => MEDIUM_BUDGET,
        Some(ReasoningEffort::High) => HIGH_BUDGET,
        Some(ReasoningEffort::Budget(tokens)) => tokens.max(MIN_BUDGET),
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn models(&self) -> Vec<ModelInfo> {
        if let Some(models) = &self.models {
            return models.clone();
        }
        let claude = |id: &str, name: &str, max_output: usize, thinking: bool| ModelInfo {
            supports_thinking: thinking,
            supports_vision: true,
            ..model(id, name, 200_000, max_output)
        };
        vec![
            claude("claude-sonnet-4-20250514", "Claude Sonnet 4", 64_000, true),
            claude("claude-opus-4-20250514", "Claude Opus 4", 32_000, true),
            claude("claude-3-7-sonnet-20250219", "Claude 3.7 Sonnet", 64_000, true),
            claude("claude-3-5-haiku-20241022", "Claude 3.5 Haiku", 8_192, false),
        ]
    }

    fn supports_vision(&self, model: &str) -> bool {
        match self.models().iter().find(|m| m.id == model) {
            Some(info) => info.supports_vision,
            // Every Claude 3+ model accepts images.
            None => model.starts_with("claude-") && !model.starts_with("claude-2"),
        }
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        let body = self.build_request_body(request);
        let emitter = Emitter::start(sink, prompt_chars(request));
        tracing::debug!(provider = %self.name, model = %request.model, "sending messages request");

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let source = match EventSource::new(builder) {
            Ok(source) => source,
            Err(err) => return Err(emitter.fail(ProviderError::StreamError(err.to_string()))),
        };

        pump(sse_payloads(source), AnthropicDecoder::default(), emitter, cancel).await
    }
}

/// Turns Messages API SSE payloads into stream events.
#[derive(Default)]
struct AnthropicDecoder {
    tools: ToolCallAccumulator,
    usage: Option<Usage>,
    complete: bool,
}

impl AnthropicDecoder {
    fn apply_usage(&mut self, data: &UsageData) {
        let usage = self.usage.get_or_insert_with(Usage::default);
        if let Some(input) = data.input_tokens {
            usage.input_tokens = Some(input);
        }
        if let Some(output) = data.output_tokens {
            usage.output_tokens = Some(output);
        }
        if let Some(created) = data.cache_creation_input_tokens {
            usage.cache_creation_tokens = created;
        }
        if let Some(read) = data.cache_read_input_tokens {
            usage.cache_read_tokens = read;
        }
    }

    fn on_event(&mut self, event: AnthropicEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        let events = match event {
            AnthropicEvent::MessageStart { message } => {
                if let Some(usage) = &message.usage {
                    self.apply_usage(usage);
                }
                vec![]
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlockInfo::ToolUse { id, name } => {
                    self.tools.push(index, Some(&id), Some(&name), None)
                }
                ContentBlockInfo::Text { text } if !text.is_empty() => {
                    vec![StreamEvent::Delta { text }]
                }
                ContentBlockInfo::Thinking {
                    thinking,
                    signature,
                } => {
                    let mut events = Vec::new();
                    if !thinking.is_empty() {
                        events.push(StreamEvent::Thinking { text: thinking });
                    }
                    if !signature.is_empty() {
                        events.push(StreamEvent::ThinkingSignature { signature });
                    }
                    events
                }
                _ => vec![],
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::Text { text } if !text.is_empty() => vec![StreamEvent::Delta { text }],
                Delta::Thinking { thinking } if !thinking.is_empty() => {
                    vec![StreamEvent::Thinking { text: thinking }]
                }
                Delta::Signature { signature } if !signature.is_empty() => {
                    vec![StreamEvent::ThinkingSignature { signature }]
                }
                Delta::InputJson { partial_json } => {
                    self.tools.push(index, None, None, Some(&partial_json))
                }
                _ => vec![],
            },
            AnthropicEvent::ContentBlockStop { index } => {
                self.tools.finish_index(index).into_iter().collect()
            }
            AnthropicEvent::MessageDelta { usage } => {
                if let Some(usage) = &usage {
                    self.apply_usage(usage);
                }
                vec![]
            }
            AnthropicEvent::MessageStop => {
                self.complete = true;
                vec![]
            }
            AnthropicEvent::Ping | AnthropicEvent::Unknown => vec![],
            AnthropicEvent::Error { error } => {
                return Err(ProviderError::StreamError(format!(
                    "{}: {}",
                    error.error_type, error.message
                )));
            }
        };
        Ok(events)
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        match serde_json::from_str::<AnthropicEvent>(payload) {
            Ok(event) => self.on_event(event),
            Err(err) => {
                tracing::debug!(error = %err, payload, "skipping malformed anthropic event");
                Ok(vec![])
            }
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.tools.finish()
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

// ──────────────────────────────────────────────────────────
// Anthropic SSE event types (internal)
// ──────────────────────────────────────────────────────────

/// Top-level SSE event from the Anthropic API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStartData },

    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u64,
        content_block: ContentBlockInfo,
    },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u64, delta: Delta },

    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u64 },

    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<UsageData>,
    },

    #[serde(rename = "message_stop")]
    MessageStop,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "error")]
    Error { error: ErrorData },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageStartData {
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::enum_variant_names)]
enum Delta {
    #[serde(rename = "text_delta")]
    Text { text: String },

    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },

    #[serde(rename = "signature_delta")]
    Signature { signature: String },

    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

// ──────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────
