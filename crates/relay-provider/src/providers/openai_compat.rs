//! Shared plumbing for backends that speak the OpenAI chat completions
//! protocol (OpenAI itself and llama.cpp's server).

use super::usable_images;
use crate::error::ProviderError;
use crate::schema::normalize_schema;
use crate::stream::{pump, sse_payloads, Emitter, SnapshotDiff, StreamDecoder, ToolCallAccumulator};
use crate::types::{Message, Role, StreamEvent, ToolDefinition, Usage};
use reqwest::Client;
use reqwest_eventsource::EventSource;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// HTTP endpoint of a chat-completions backend.
pub(crate) struct CompatTransport {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl CompatTransport {
    pub(crate) fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            api_key,
        }
    }

    pub(crate) fn set_base_url(&mut self, url: String) {
        self.base_url = url.trim_end_matches('/').to_string();
    }

    /// POST `body` to `{base}/chat/completions` and stream the reply.
    pub(crate) async fn stream(
        &self,
        body: &Value,
        input_chars: usize,
        decoder: ChatCompletionsDecoder,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        let emitter = Emitter::start(sink, input_chars);
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let source = match EventSource::new(builder) {
            Ok(source) => source,
            Err(err) => return Err(emitter.fail(ProviderError::StreamError(err.to_string()))),
        };
        pump(sse_payloads(source), decoder, emitter, cancel).await
    }
}

/// Convert the system prompt and history to OpenAI message format.
pub(crate) fn convert_messages(
    system: Option<&str>,
    messages: &[Message],
    vision: bool,
    model: &str,
) -> Vec<Value> {
    let mut out = Vec::new();

    if let Some(system) = system.filter(|s| !s.is_empty()) {
        out.push(json!({"role": "system", "content": system}));
    }

    for msg in messages {
        // Tool results are sent as role=tool, one message per result.
        if !msg.tool_results.is_empty() {
            for result in &msg.tool_results {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": result.tool_call_id,
                    "content": result.content,
                }));
            }
            if msg.content.is_empty() {
                continue;
            }
        }

        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let mut msg_json = json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": tool_calls,
            });
            if !msg.content.is_empty() {
                msg_json["content"] = json!(msg.content);
            }
            out.push(msg_json);
            continue;
        }

        let images = if msg.role == Role::User {
            usable_images(msg, vision, model)
        } else {
            Vec::new()
        };
        if images.is_empty() {
            out.push(json!({"role": msg.role.to_string(), "content": msg.content}));
        } else {
            let mut parts = vec![json!({"type": "text", "text": msg.content})];
            parts.extend(images.into_iter().map(|image| {
                json!({"type": "image_url", "image_url": {"url": image.data_uri()}})
            }));
            out.push(json!({"role": msg.role.to_string(), "content": parts}));
        }
    }

    out
}

/// Convert tool definitions to OpenAI function tools.
pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": normalize_schema(&t.input_schema),
                }
            })
        })
        .collect()
}

/// Decodes `chat.completion.chunk` payloads.
#[derive(Default)]
pub(crate) struct ChatCompletionsDecoder {
    tools: ToolCallAccumulator,
    /// Set for backends that resend the full reasoning text on every chunk.
    reasoning_snapshots: Option<SnapshotDiff>,
    usage: Option<Usage>,
    timings: Option<Usage>,
    complete: bool,
}

impl ChatCompletionsDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Diff reasoning values against everything seen so far.
    pub(crate) fn with_reasoning_snapshots(mut self) -> Self {
        self.reasoning_snapshots = Some(SnapshotDiff::default());
        self
    }

    fn on_chunk(&mut self, chunk: Chunk) -> Result<Vec<StreamEvent>, ProviderError> {
        if let Some(error) = chunk.error {
            let message = match &error {
                Value::String(message) => message.clone(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            return Err(ProviderError::StreamError(message));
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;

            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                let text = match &mut self.reasoning_snapshots {
                    Some(diff) => diff.next(&reasoning),
                    None => Some(reasoning).filter(|r| !r.is_empty()),
                };
                if let Some(text) = text {
                    events.push(StreamEvent::Thinking { text });
                }
            }

            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::Delta { text: content });
            }

            for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let index = call.index.unwrap_or(position as u64);
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                events.extend(self.tools.push(
                    index,
                    call.id.as_deref(),
                    name.as_deref(),
                    arguments.as_deref(),
                ));
            }

            if choice.finish_reason.is_some() {
                events.extend(self.tools.finish());
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cache_creation_tokens: 0,
                cache_read_tokens: usage
                    .prompt_tokens_details
                    .map_or(0, |details| details.cached_tokens),
            });
        }
        if let Some(timings) = chunk.timings {
            self.timings = Some(Usage {
                input_tokens: timings.prompt_n,
                output_tokens: timings.predicted_n,
                ..Usage::default()
            });
        }

        Ok(events)
    }
}

impl StreamDecoder for ChatCompletionsDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.complete = true;
            return Ok(vec![]);
        }
        match serde_json::from_str::<Chunk>(payload) {
            Ok(chunk) => self.on_chunk(chunk),
            Err(err) => {
                tracing::debug!(error = %err, payload, "skipping malformed completion chunk");
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
        self.usage.or(self.timings)
    }
}

// — chunk types for deserialization —

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    /// llama.cpp server timings.
    #[serde(default)]
    timings: Option<Timings>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<u64>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Timings {
    #[serde(default)]
    prompt_n: Option<u64>,
    #[serde(default)]
    predicted_n: Option<u64>,
}
