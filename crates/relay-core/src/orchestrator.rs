//! Tool-calling orchestration loop.
//!
//! The loop is the core processing cycle:
//! 1. Stream one model turn from the provider
//! 2. Collect any tool calls it issued
//! 3. Execute them and append the results to the history
//! 4. Repeat until the model stops calling tools or the cap is reached

use crate::executor::ToolExecutor;
use relay_provider::{
    ChatRequest, Message, MessageId, Metrics, Provider, ProviderError, Reasoning, StreamEvent,
    ToolCall, ToolResult,
};
use serde::ser::{Serialize, Serializer};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const MIN_ITERATIONS: usize = 1;
pub const MAX_ITERATIONS: usize = 50;

/// Loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Requested iteration cap; clamped to `MIN_ITERATIONS..=MAX_ITERATIONS`.
    pub max_iterations: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl LoopConfig {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }

    pub fn effective_cap(&self) -> usize {
        self.max_iterations.clamp(MIN_ITERATIONS, MAX_ITERATIONS)
    }
}

/// One record of loop output, tagged with the iteration that produced it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LoopEvent {
    pub iteration: usize,
    #[serde(flatten)]
    pub kind: LoopEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEventKind {
    /// An adapter event, forwarded unchanged.
    Stream(StreamEvent),
    ToolExecuting {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    /// Terminal success.
    Complete {
        message_id: MessageId,
        content: String,
        iterations: usize,
        tool_calls: usize,
        reached_cap: bool,
    },
    /// Terminal failure.
    Error { message: String },
}

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LoopRecord<'a> {
    ToolExecuting {
        id: &'a str,
        name: &'a str,
        arguments: &'a Value,
    },
    ToolResult {
        id: &'a str,
        name: &'a str,
        content: &'a str,
        is_error: bool,
    },
    Complete {
        message_id: &'a MessageId,
        content: &'a str,
        iterations: usize,
        tool_calls: usize,
        reached_cap: bool,
    },
    Error {
        message: &'a str,
    },
}

// Stream events keep their own `type` tag so that loop records and adapter
// events share one flat shape.
impl Serialize for LoopEventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LoopEventKind::Stream(event) => event.serialize(serializer),
            LoopEventKind::ToolExecuting {
                id,
                name,
                arguments,
            } => LoopRecord::ToolExecuting {
                id,
                name,
                arguments,
            }
            .serialize(serializer),
            LoopEventKind::ToolResult {
                id,
                name,
                content,
                is_error,
            } => LoopRecord::ToolResult {
                id,
                name,
                content,
                is_error: *is_error,
            }
            .serialize(serializer),
            LoopEventKind::Complete {
                message_id,
                content,
                iterations,
                tool_calls,
                reached_cap,
            } => LoopRecord::Complete {
                message_id,
                content,
                iterations: *iterations,
                tool_calls: *tool_calls,
                reached_cap: *reached_cap,
            }
            .serialize(serializer),
            LoopEventKind::Error { message } => LoopRecord::Error { message }.serialize(serializer),
        }
    }
}

/// A finished run.
#[derive(Debug, Clone)]
pub struct LoopCompletion {
    /// Final assistant message.
    pub message: Message,
    /// Tool-call echoes and tool-result turns appended during the run.
    pub turns: Vec<Message>,
    pub iterations: usize,
    pub tool_calls: usize,
    pub reached_cap: bool,
    /// Metrics of every model turn, in order.
    pub metrics: Vec<Metrics>,
}

#[derive(Debug, Clone)]
pub enum LoopOutcome {
    Completed(LoopCompletion),
    /// Stopped by cancellation; no terminal event was emitted.
    Cancelled,
}

/// Errors that can occur during a loop run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Output of one model turn.
#[derive(Default)]
struct Turn {
    text: String,
    thinking: String,
    thinking_first: bool,
    signature: String,
    tool_calls: Vec<ToolCall>,
    metrics: Option<Metrics>,
}

impl Turn {
    fn absorb(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Delta { text } => self.text.push_str(text),
            StreamEvent::Thinking { text } => {
                if self.thinking.is_empty() && !text.is_empty() {
                    self.thinking_first = self.text.is_empty();
                }
                self.thinking.push_str(text);
            }
            StreamEvent::ThinkingSignature { signature } => self.signature = signature.clone(),
            StreamEvent::ToolComplete {
                id,
                name,
                arguments,
            } => {
                // Arguments that failed to parse degrade to an empty object.
                let arguments = arguments.clone().unwrap_or_else(|| {
                    tracing::debug!(tool = %name, "tool arguments did not parse, sending {{}}");
                    json!({})
                });
                let call = ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments,
                };
                match self.tool_calls.iter_mut().find(|c| c.id == *id) {
                    Some(existing) => *existing = call,
                    None => self.tool_calls.push(call),
                }
            }
            StreamEvent::Metrics(metrics) => self.metrics = Some(metrics.clone()),
            _ => {}
        }
    }

    /// Reasoning and answer combined. Reasoning is wrapped and leads only
    /// when it started before any answer text.
    fn final_content(&self) -> String {
        if self.thinking.is_empty() {
            self.text.clone()
        } else if self.thinking_first {
            format!("<think>\n{}\n</think>\n\n{}", self.thinking, self.text)
        } else {
            format!("{}\n\n{}", self.text, self.thinking)
        }
    }

    fn reasoning(&self) -> Option<Reasoning> {
        (!self.signature.is_empty()).then(|| Reasoning {
            text: self.thinking.clone(),
            signature: self.signature.clone(),
        })
    }

    /// Assistant turn echoing this turn's text and calls.
    fn echo(&self) -> Message {
        let message = Message::assistant_tool_calls(self.text.clone(), self.tool_calls.clone());
        match self.reasoning() {
            Some(reasoning) => message.with_reasoning(reasoning),
            None => message,
        }
    }
}

/// Drives one provider and one tool executor through a chat.
pub struct Orchestrator<'a> {
    provider: &'a dyn Provider,
    tools: &'a dyn ToolExecutor,
    config: LoopConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(provider: &'a dyn Provider, tools: &'a dyn ToolExecutor) -> Self {
        Self {
            provider,
            tools,
            config: LoopConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the loop to completion, cancellation or a provider failure.
    ///
    /// When `request.tools` is empty the executor's catalog is advertised.
    pub async fn run(
        &self,
        mut request: ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(LoopEvent) + Send),
    ) -> Result<LoopOutcome, OrchestratorError> {
        let cap = self.config.effective_cap();
        if request.tools.is_empty() {
            request.tools = self.tools.catalog().await;
        }

        let mut turns = Vec::new();
        let mut metrics = Vec::new();
        let mut issued = Vec::new();
        let mut last = Turn::default();

        for iteration in 0..cap {
            if cancel.is_cancelled() {
                return Ok(LoopOutcome::Cancelled);
            }
            tracing::debug!(
                provider = self.provider.name(),
                model = %request.model,
                iteration,
                messages = request.messages.len(),
                "starting model turn"
            );

            let mut turn = Turn::default();
            let result = {
                let mut handler = |event: StreamEvent| {
                    turn.absorb(&event);
                    sink(LoopEvent {
                        iteration,
                        kind: LoopEventKind::Stream(event),
                    });
                };
                self.provider.chat(&request, cancel, &mut handler).await
            };

            match result {
                Ok(()) => {}
                Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                    tracing::debug!(iteration, "chat cancelled during model turn");
                    return Ok(LoopOutcome::Cancelled);
                }
                Err(err) => {
                    tracing::warn!(provider = self.provider.name(), error = %err, "model turn failed");
                    sink(LoopEvent {
                        iteration,
                        kind: LoopEventKind::Error {
                            message: err.to_string(),
                        },
                    });
                    return Err(err.into());
                }
            }
            metrics.extend(turn.metrics.take());

            if turn.tool_calls.is_empty() {
                return Ok(complete(
                    turn,
                    iteration + 1,
                    issued,
                    false,
                    turns,
                    metrics,
                    sink,
                ));
            }

            let mut results = Vec::with_capacity(turn.tool_calls.len());
            for call in &turn.tool_calls {
                sink(LoopEvent {
                    iteration,
                    kind: LoopEventKind::ToolExecuting {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                });
                let Some(result) = self.execute(call, cancel).await else {
                    tracing::debug!(iteration, tool = %call.name, "chat cancelled during tool call");
                    return Ok(LoopOutcome::Cancelled);
                };
                sink(LoopEvent {
                    iteration,
                    kind: LoopEventKind::ToolResult {
                        id: result.tool_call_id.clone(),
                        name: result.name.clone(),
                        content: result.content.clone(),
                        is_error: result.is_error,
                    },
                });
                results.push(result);
            }
            issued.extend(turn.tool_calls.iter().cloned());

            let echo = turn.echo();
            let answers = Message::tool_results(results);
            request.messages.push(echo.clone());
            request.messages.push(answers.clone());
            turns.push(echo);
            turns.push(answers);
            last = turn;
        }

        tracing::info!(cap, tool_calls = issued.len(), "tool iteration cap reached");
        Ok(complete(last, cap, issued, true, turns, metrics, sink))
    }

    /// Run one call. `None` means the run was cancelled.
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> Option<ToolResult> {
        let (content, is_error) = match self
            .tools
            .invoke(&call.name, call.arguments.clone(), cancel)
            .await
        {
            Ok(output) => (output.text, output.is_error),
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => return None,
            Err(err) => {
                tracing::debug!(tool = %call.name, error = %err, "tool call failed");
                (format!("Tool error: {err}"), true)
            }
        };

        Some(ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        })
    }
}

/// Build the final message, carrying every call issued during the run.
fn complete(
    turn: Turn,
    iterations: usize,
    issued: Vec<ToolCall>,
    reached_cap: bool,
    turns: Vec<Message>,
    metrics: Vec<Metrics>,
    sink: &mut (dyn FnMut(LoopEvent) + Send),
) -> LoopOutcome {
    let tool_calls = issued.len();
    let message = Message::assistant_tool_calls(turn.final_content(), issued);
    sink(LoopEvent {
        iteration: iterations - 1,
        kind: LoopEventKind::Complete {
            message_id: message.id.clone(),
            content: message.content.clone(),
            iterations,
            tool_calls,
            reached_cap,
        },
    });
    LoopOutcome::Completed(LoopCompletion {
        message,
        turns,
        iterations,
        tool_calls,
        reached_cap,
        metrics,
    })
}
