//! Ollama provider using the native `/api/chat` NDJSON stream.

use super::{model, usable_images, ProviderKind};
use crate::error::ProviderError;
use crate::metrics::prompt_chars;
use crate::schema::normalize_schema;
use crate::stream::{
    cancellable, complete_tool_call, ndjson_payloads, parse_arguments, pump, synthesize_call_id,
    Emitter, StreamDecoder,
};
use crate::traits::Provider;
use crate::types::{ChatRequest, Message, ModelInfo, Role, StreamEvent, ToolDefinition, Usage};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Model name fragments that identify multimodal families.
const VISION_FAMILIES: &[&str] = &[
    "llava",
    "bakllava",
    "vision",
    "gemma3",
    "qwen2.5vl",
    "qwen2.5-vl",
    "minicpm-v",
    "moondream",
    "llama4",
    "mistral-small3",
];

/// Provider for a local or remote Ollama daemon.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    name: String,
    models: Option<Vec<ModelInfo>>,
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            name: ProviderKind::Ollama.as_str().to_string(),
            models: None,
        }
    }

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

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = Some(models);
        self
    }

    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let vision = self.supports_vision(&request.model);
        let mut messages = Vec::new();
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            self.convert_message(msg, vision, &request.model, &mut messages);
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| self.convert_tool(t))
                .collect::<Vec<_>>());
        }

        let opts = &request.options;
        if opts.thinking.is_some() || opts.reasoning_effort.is_some() {
            body["think"] = json!(opts.wants_thinking());
        }

        let mut options = Map::new();
        if let Some(temperature) = opts.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = opts.top_p {
            options.insert("top_p".into(), json!(top_p));
        }
        if let Some(top_k) = opts.top_k {
            options.insert("top_k".into(), json!(top_k));
        }
        if let Some(seed) = opts.seed {
            options.insert("seed".into(), json!(seed));
        }
        if !opts.stop.is_empty() {
            options.insert("stop".into(), json!(opts.stop));
        }
        if let Some(max_tokens) = opts.max_tokens {
            options.insert("num_predict".into(), json!(max_tokens));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        body
    }

    fn convert_message(&self, msg: &Message, vision: bool, model: &str, out: &mut Vec<Value>) {
        for result in &msg.tool_results {
            out.push(json!({
                "role": "tool",
                "content": result.content,
                "tool_name": result.name,
            }));
        }
        if !msg.tool_results.is_empty() && msg.content.is_empty() {
            return;
        }

        let mut value = json!({
            "role": msg.role.to_string(),
            "content": msg.content,
        });
        if msg.role == Role::User {
            let images: Vec<&str> = usable_images(msg, vision, model)
                .into_iter()
                .map(|image| image.data.as_str())
                .collect();
            if !images.is_empty() {
                value["images"] = json!(images);
            }
        }
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            value["tool_calls"] = json!(msg
                .tool_calls
                .iter()
                .map(|call| json!({
                    "function": {"name": call.name, "arguments": call.arguments}
                }))
                .collect::<Vec<_>>());
        }
        out.push(value);
    }

    fn convert_tool(&self, tool: &ToolDefinition) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": normalize_schema(&tool.input_schema),
            }
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::ApiError { status, body });
        }
        Ok(response)
    }
}

/// Whether an Ollama model name belongs to a vision-capable family.
pub fn is_vision_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    VISION_FAMILIES.iter().any(|family| model.contains(family))
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn models(&self) -> Vec<ModelInfo> {
        if let Some(models) = &self.models {
            return models.clone();
        }
        vec![
            model("llama3.1", "Llama 3.1", 131_072, 8_192),
            ModelInfo {
                supports_thinking: true,
                ..model("qwen3", "Qwen 3", 40_960, 16_384)
            },
            ModelInfo {
                supports_vision: true,
                ..model("gemma3", "Gemma 3", 131_072, 8_192)
            },
        ]
    }

    fn supports_vision(&self, model: &str) -> bool {
        match self.models().iter().find(|m| m.id == model) {
            Some(info) => info.supports_vision,
            None => is_vision_model(model),
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
        tracing::debug!(provider = %self.name, model = %request.model, "sending ollama chat request");

        let response = match cancellable(cancel, self.send(&body)).await {
            Ok(response) => response,
            Err(err) => return Err(emitter.fail(err)),
        };
        pump(ndjson_payloads(response), OllamaDecoder::default(), emitter, cancel).await
    }
}

/// Decodes `/api/chat` NDJSON lines.
#[derive(Default)]
struct OllamaDecoder {
    usage: Option<Usage>,
    complete: bool,
}

impl StreamDecoder for OllamaDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let line: ChatLine = match serde_json::from_str(payload) {
            Ok(line) => line,
            Err(err) => {
                tracing::debug!(error = %err, payload, "skipping malformed ollama line");
                return Ok(vec![]);
            }
        };

        if let Some(error) = line.error {
            return Err(ProviderError::StreamError(error));
        }

        let mut events = Vec::new();
        if let Some(message) = line.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::Thinking { text: thinking });
            }
            if !message.content.is_empty() {
                events.push(StreamEvent::Delta {
                    text: message.content,
                });
            }
            for call in message.tool_calls {
                let id = call.id.unwrap_or_else(synthesize_call_id);
                let arguments = match call.function.arguments {
                    Value::Null => Some(json!({})),
                    // Some models double-encode arguments as a JSON string.
                    Value::String(raw) => parse_arguments(&raw),
                    other => Some(other),
                };
                events.extend(complete_tool_call(id, call.function.name, arguments));
            }
        }

        if line.done {
            self.complete = true;
            if line.prompt_eval_count.is_some() || line.eval_count.is_some() {
                self.usage = Some(Usage {
                    input_tokens: line.prompt_eval_count,
                    output_tokens: line.eval_count,
                    ..Usage::default()
                });
            }
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        vec![]
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

// — NDJSON line types —

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<LineToolCall>,
}

#[derive(Debug, Deserialize)]
struct LineToolCall {
    #[serde(default)]
    id: Option<String>,
    function: LineFunction,
}

#[derive(Debug, Deserialize)]
struct LineFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}
