//! Provider-agnostic conversation, request and stream types.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Unique message identifier based on ULID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new unique message ID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create a MessageId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User input, including synthetic tool-result turns.
    User,
    /// Model output.
    Assistant,
    /// System prompt.
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Binary blob attached to a message, carried as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
    /// Original file name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    /// Build an attachment from raw bytes.
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            name: None,
        }
    }

    /// Set the original file name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether this attachment is an image.
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// `data:` URI form used by OpenAI-shaped multimodal APIs.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// A tool invocation issued by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, stable from `ToolStart` through `ToolComplete`.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed arguments. `Null` when the streamed arguments did not parse.
    pub arguments: Value,
}

/// The outcome of one tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the [`ToolCall`] this answers.
    pub tool_call_id: String,
    /// Name of the tool that ran.
    pub name: String,
    /// Result text.
    pub content: String,
    /// Whether the tool reported a failure.
    pub is_error: bool,
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Who sent this message.
    pub role: Role,
    /// Free-text content.
    pub content: String,
    /// Attachments, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Tool calls issued by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool results carried by a synthetic user turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    /// Signed reasoning replayed ahead of an assistant turn's tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}

/// Reasoning text plus the provider's signature over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reasoning {
    pub text: String,
    pub signature: String,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            reasoning: None,
        }
    }

    /// Create a user message from text.
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text.into())
    }

    /// Create an assistant message from text.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text.into())
    }

    /// Create a system message from text.
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text.into())
    }

    /// Assistant turn echoing the tool calls it issued.
    pub fn assistant_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, text.into())
        }
    }

    /// Synthetic user turn carrying tool results.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::with_role(Role::User, String::new())
        }
    }

    /// Attach signed reasoning.
    pub fn with_reasoning(mut self, reasoning: Reasoning) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    /// Append an attachment.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Tool capability descriptor sent to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, unique within the aggregate catalog.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// Requested reasoning effort: a qualitative level or a token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEffort", into = "RawEffort")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    /// Explicit thinking budget in tokens.
    Budget(u32),
}

impl ReasoningEffort {
    /// The qualitative level, mapping numeric budgets onto the nearest one.
    pub fn level(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Budget(tokens) if *tokens < 8_192 => "low",
            ReasoningEffort::Budget(tokens) if *tokens < 24_576 => "medium",
            ReasoningEffort::Budget(_) => "high",
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            other => other
                .parse::<u32>()
                .map(ReasoningEffort::Budget)
                .map_err(|_| format!("invalid reasoning effort '{s}'")),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawEffort {
    Budget(u32),
    Level(String),
}

impl TryFrom<RawEffort> for ReasoningEffort {
    type Error = String;

    fn try_from(raw: RawEffort) -> Result<Self, Self::Error> {
        match raw {
            RawEffort::Budget(tokens) => Ok(ReasoningEffort::Budget(tokens)),
            RawEffort::Level(level) => level.parse(),
        }
    }
}

impl From<ReasoningEffort> for RawEffort {
    fn from(effort: ReasoningEffort) -> Self {
        match effort {
            ReasoningEffort::Budget(tokens) => RawEffort::Budget(tokens),
            other => RawEffort::Level(other.level().to_string()),
        }
    }
}

/// Sampling options. Absent fields mean "provider default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Thinking/reasoning toggle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Grammar constraint (GBNF) for backends that support one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
}

impl SamplingOptions {
    /// Whether the caller asked for reasoning, explicitly or through an effort.
    pub fn wants_thinking(&self) -> bool {
        match self.thinking {
            Some(enabled) => enabled,
            None => self.reasoning_effort.is_some(),
        }
    }
}

/// One adapter invocation.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Target model id.
    pub model: String,
    /// System prompt.
    pub system: Option<String>,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Available tools.
    pub tools: Vec<ToolDefinition>,
    /// Sampling options.
    pub options: SamplingOptions,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// `None` when the provider did not report the counter.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

/// Per-invocation performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    /// Milliseconds until the first content or tool event.
    pub ttfb_ms: u64,
    /// Milliseconds for the whole invocation.
    pub total_ms: u64,
    pub tokens_per_second: f64,
    /// Whether any token count is a `chars / 4` estimate.
    pub estimated: bool,
}

/// Events emitted by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Invocation started. Emitted exactly once.
    Start,
    /// A chunk of answer text.
    Delta { text: String },
    /// A chunk of reasoning text.
    Thinking { text: String },
    /// Signature over the reasoning block, for backends that verify replayed reasoning.
    ThinkingSignature { signature: String },
    /// A tool call began.
    ToolStart { id: String, name: String },
    /// A fragment of tool-call argument JSON.
    ToolDelta { id: String, delta: String },
    /// A tool call is complete. `arguments` is `None` when they failed to parse.
    ToolComplete {
        id: String,
        name: String,
        arguments: Option<Value>,
    },
    /// Usage and timing for the invocation.
    Metrics(Metrics),
    /// Terminal failure.
    Error { message: String },
    /// Terminal success.
    Done,
}

impl StreamEvent {
    /// Whether this event counts toward time-to-first-byte.
    pub fn is_content(&self) -> bool {
        match self {
            StreamEvent::Delta { text } | StreamEvent::Thinking { text } => !text.is_empty(),
            StreamEvent::ToolStart { .. }
            | StreamEvent::ToolDelta { .. }
            | StreamEvent::ToolComplete { .. } => true,
            _ => false,
        }
    }
}

/// Information about a model supported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g., "claude-sonnet-4-20250514").
    pub id: String,
    /// Human-readable model name.
    pub name: String,
    /// Maximum context window in tokens.
    pub context_window: usize,
    /// Maximum output tokens.
    pub max_output_tokens: usize,
    /// Whether the model supports extended thinking.
    pub supports_thinking: bool,
    /// Whether the model supports tool use.
    pub supports_tools: bool,
    /// Whether the model accepts image input.
    pub supports_vision: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_event_wire_shape() {
        let event = StreamEvent::ToolComplete {
            id: "call_1".to_string(),
            name: "read".to_string(),
            arguments: Some(json!({"path": "a.txt"})),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_complete");
        assert_eq!(value["arguments"]["path"], "a.txt");

        let metrics = serde_json::to_value(StreamEvent::Metrics(Metrics {
            input_tokens: 3,
            ..Metrics::default()
        }))
        .unwrap();
        assert_eq!(metrics["type"], "metrics");
        assert_eq!(metrics["input_tokens"], 3);
    }

    #[test]
    fn test_reasoning_effort_from_string_or_number() {
        let level: ReasoningEffort = serde_json::from_value(json!("high")).unwrap();
        assert_eq!(level, ReasoningEffort::High);
        let budget: ReasoningEffort = serde_json::from_value(json!(12000)).unwrap();
        assert_eq!(budget, ReasoningEffort::Budget(12000));
        assert!(serde_json::from_value::<ReasoningEffort>(json!("extreme")).is_err());
        assert_eq!(serde_json::to_value(ReasoningEffort::Medium).unwrap(), "medium");
    }

    #[test]
    fn test_budget_maps_to_level() {
        assert_eq!(ReasoningEffort::Budget(1_024).level(), "low");
        assert_eq!(ReasoningEffort::Budget(10_000).level(), "medium");
        assert_eq!(ReasoningEffort::Budget(64_000).level(), "high");
    }

    #[test]
    fn test_wants_thinking() {
        assert!(!SamplingOptions::default().wants_thinking());
        let effort_only = SamplingOptions {
            reasoning_effort: Some(ReasoningEffort::Low),
            ..Default::default()
        };
        assert!(effort_only.wants_thinking());
        let disabled = SamplingOptions {
            thinking: Some(false),
            reasoning_effort: Some(ReasoningEffort::Low),
            ..Default::default()
        };
        assert!(!disabled.wants_thinking());
    }

    #[test]
    fn test_attachment_data_uri() {
        let attachment = Attachment::from_bytes("image/png", b"abc");
        assert!(attachment.is_image());
        assert_eq!(attachment.data_uri(), "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_tool_results_turn_is_user() {
        let msg = Message::tool_results(vec![ToolResult {
            tool_call_id: "c1".to_string(),
            name: "echo".to_string(),
            content: "ok".to_string(),
            is_error: false,
        }]);
        assert_eq!(msg.role, Role::User);
        assert!(msg.content.is_empty());
        assert_eq!(msg.tool_results.len(), 1);
    }
}
