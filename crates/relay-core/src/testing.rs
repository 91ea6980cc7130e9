//! Scripted provider and tool fakes for loop and gateway tests.

use crate::executor::ToolExecutor;
use async_trait::async_trait;
use relay_mcp::{McpError, McpToolCallResult};
use relay_provider::{
    ChatRequest, Metrics, ModelInfo, Provider, ProviderError, ProviderKind, StreamEvent,
    ToolDefinition,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn metrics() -> StreamEvent {
    StreamEvent::Metrics(Metrics {
        input_tokens: 10,
        output_tokens: 5,
        estimated: true,
        ..Default::default()
    })
}

pub(crate) fn text_turn(chunks: &[&str]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Start];
    events.extend(chunks.iter().map(|c| StreamEvent::Delta {
        text: c.to_string(),
    }));
    events.push(metrics());
    events.push(StreamEvent::Done);
    events
}

pub(crate) fn tool_turn(id: &str, name: &str, arguments: Value) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start,
        StreamEvent::ToolStart {
            id: id.to_string(),
            name: name.to_string(),
        },
        StreamEvent::ToolDelta {
            id: id.to_string(),
            delta: arguments.to_string(),
        },
        StreamEvent::ToolComplete {
            id: id.to_string(),
            name: name.to_string(),
            arguments: Some(arguments),
        },
        metrics(),
        StreamEvent::Done,
    ]
}

pub(crate) fn thinking_turn(thinking: &str, text: &str, thinking_first: bool) -> Vec<StreamEvent> {
    let thought = StreamEvent::Thinking {
        text: thinking.to_string(),
    };
    let answer = StreamEvent::Delta {
        text: text.to_string(),
    };
    let (a, b) = if thinking_first {
        (thought, answer)
    } else {
        (answer, thought)
    };
    vec![StreamEvent::Start, a, b, metrics(), StreamEvent::Done]
}

/// A turn that fails with an in-stream provider error.
pub(crate) fn error_turn(message: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start,
        StreamEvent::Error {
            message: message.to_string(),
        },
    ]
}

/// Plays back one scripted turn per call. Once the script runs out the last
/// turn is replayed.
pub(crate) struct ScriptedProvider {
    name: String,
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    last: Mutex<Vec<StreamEvent>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
        Self::named("scripted", turns)
    }

    pub(crate) fn named(name: &str, turns: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            name: name.to_string(),
            turns: Mutex::new(turns.into()),
            last: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.requests.lock().unwrap().push(request.clone());
        let turn = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.turns.lock().unwrap().pop_front() {
                *last = next;
            }
            last.clone()
        };
        for event in turn {
            if let StreamEvent::Error { message } = &event {
                let message = message.clone();
                sink(event);
                return Err(ProviderError::StreamError(message));
            }
            sink(event);
        }
        Ok(())
    }
}

/// Executor with two tools: `lookup` echoes its `q` argument and `broken`
/// reports a tool-side failure. `hang` blocks until cancelled; anything else
/// is unknown.
#[derive(Default)]
pub(crate) struct FakeTools {
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeTools {
    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

fn output(text: String, is_error: bool) -> McpToolCallResult {
    McpToolCallResult {
        text,
        structured_content: None,
        raw_content: Vec::new(),
        is_error,
    }
}

#[async_trait]
impl ToolExecutor for FakeTools {
    async fn catalog(&self) -> Vec<ToolDefinition> {
        ["lookup", "broken"]
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect()
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpToolCallResult, McpError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        match name {
            "lookup" => Ok(output(
                format!(
                    "lookup says {}",
                    arguments.get("q").and_then(Value::as_str).unwrap_or("")
                ),
                false,
            )),
            "broken" => Ok(output("broken tool failed".to_string(), true)),
            "hang" => {
                cancel.cancelled().await;
                Err(McpError::Cancelled)
            }
            other => Err(McpError::UnknownTool(other.to_string())),
        }
    }
}

/// Starts streaming, then waits until cancelled.
pub(crate) struct PendingProvider {
    name: String,
}

impl PendingProvider {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Provider for PendingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LlamaCpp
    }

    fn models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    async fn chat(
        &self,
        _request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        sink(StreamEvent::Start);
        sink(StreamEvent::Delta {
            text: "partial".to_string(),
        });
        cancel.cancelled().await;
        Err(ProviderError::Cancelled)
    }
}
