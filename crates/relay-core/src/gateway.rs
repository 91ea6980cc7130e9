//! The gateway context: provider registry, tool client and live streams.

use crate::cancel::{ActiveStream, CancellationRegistry};
use crate::config::Config;
use crate::error::RelayError;
use crate::orchestrator::{LoopConfig, LoopEvent, LoopOutcome, Orchestrator, OrchestratorError};
use futures::future::join_all;
use relay_mcp::{McpManager, McpToolInfo, ServerStatus};
use relay_provider::{AnyProvider, ChatRequest, Metrics, Provider, StreamEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// One provider/model pair in a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompareTarget {
    pub provider: String,
    pub model: String,
}

impl CompareTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Parses `provider:model`. The model may itself contain colons.
impl FromStr for CompareTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            _ => Err(format!("expected <provider>:<model>, got '{s}'")),
        }
    }
}

impl fmt::Display for CompareTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// An adapter event from one comparison target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompareEvent {
    /// Position of the target in the request.
    pub index: usize,
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub event: StreamEvent,
}

/// Collected output of one comparison target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompareResult {
    pub provider: String,
    pub model: String,
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompareResult {
    fn failed(target: &CompareTarget, error: String) -> Self {
        Self {
            provider: target.provider.clone(),
            model: target.model.clone(),
            content: String::new(),
            thinking: String::new(),
            metrics: None,
            error: Some(error),
        }
    }
}

/// Explicitly constructed context shared by every request.
pub struct Gateway {
    providers: HashMap<String, Arc<dyn Provider>>,
    tools: Arc<McpManager>,
    streams: CancellationRegistry,
    loop_config: LoopConfig,
    default_provider: Option<String>,
    default_model: Option<String>,
}

impl Gateway {
    pub fn new(tools: Arc<McpManager>) -> Self {
        Self {
            providers: HashMap::new(),
            tools,
            streams: CancellationRegistry::new(),
            loop_config: LoopConfig::default(),
            default_provider: None,
            default_model: None,
        }
    }

    pub fn with_loop_config(mut self, loop_config: LoopConfig) -> Self {
        self.loop_config = loop_config;
        self
    }

    /// Build providers and start enabled tool servers.
    ///
    /// Providers that cannot be built (e.g. a cloud backend without a key)
    /// and tool servers that fail to start are logged and skipped.
    pub async fn from_config(config: &Config) -> Result<Self, RelayError> {
        config.validate()?;
        let base_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let tools = Arc::new(McpManager::new(base_cwd));

        let mut gateway = Self::new(Arc::clone(&tools))
            .with_loop_config(LoopConfig::new(config.max_tool_iterations));
        for provider_config in &config.providers {
            match AnyProvider::from_config(provider_config) {
                Ok(provider) => gateway.register_provider(Arc::new(provider)),
                Err(err) => tracing::warn!(
                    provider = %provider_config.registry_name(),
                    error = %err,
                    "provider unavailable"
                ),
            }
        }
        gateway.default_provider = Some(config.default_provider.clone());
        gateway.default_model = Some(config.default_model.clone());

        tools.start_all(&config.mcp_servers).await;
        tracing::info!(
            providers = gateway.providers.len(),
            mcp_servers = tools.status().await.len(),
            "gateway ready"
        );
        Ok(gateway)
    }

    /// Register `provider` under its name, replacing any previous one.
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        tracing::debug!(provider = %name, kind = %provider.kind(), "provider registered");
        self.providers.insert(name, provider);
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn default_provider(&self) -> Option<&str> {
        self.default_provider.as_deref()
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Register a stream. Read its id before running so it can be cancelled.
    pub fn open_stream(&self) -> ActiveStream {
        self.streams.register()
    }

    /// Cancel a running stream by id.
    pub fn cancel(&self, stream_id: &str) -> bool {
        self.streams.cancel(stream_id)
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Run the tool-calling loop for one chat on `provider`.
    ///
    /// The stream's registry entry is removed when this returns.
    pub async fn run_chat(
        &self,
        stream: ActiveStream,
        provider: &str,
        request: ChatRequest,
        sink: &mut (dyn FnMut(LoopEvent) + Send),
    ) -> Result<LoopOutcome, OrchestratorError> {
        let adapter = self
            .provider(provider)
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.to_string()))?;
        tracing::info!(stream = %stream.id(), provider, model = %request.model, "chat started");

        let outcome = Orchestrator::new(adapter.as_ref(), self.tools.as_ref())
            .with_config(self.loop_config)
            .run(request, stream.token(), sink)
            .await;

        match &outcome {
            Ok(LoopOutcome::Completed(done)) => tracing::info!(
                stream = %stream.id(),
                iterations = done.iterations,
                tool_calls = done.tool_calls,
                "chat complete"
            ),
            Ok(LoopOutcome::Cancelled) => tracing::info!(stream = %stream.id(), "chat cancelled"),
            Err(err) => tracing::warn!(stream = %stream.id(), error = %err, "chat failed"),
        }
        outcome
    }

    /// Send one request to several provider/model pairs at once, without
    /// tools. Results come back in target order.
    pub async fn compare(
        &self,
        stream: ActiveStream,
        targets: &[CompareTarget],
        request: ChatRequest,
        sink: &mut (dyn FnMut(CompareEvent) + Send),
    ) -> Vec<CompareResult> {
        let writer = Mutex::new(sink);
        let cancel = stream.token();
        tracing::info!(stream = %stream.id(), targets = targets.len(), "compare started");

        let runs = targets.iter().enumerate().map(|(index, target)| {
            let writer = &writer;
            let mut request = request.clone();
            request.model = target.model.clone();
            request.tools.clear();
            async move {
                let Some(adapter) = self.provider(&target.provider) else {
                    return CompareResult::failed(
                        target,
                        format!("Unknown provider: {}", target.provider),
                    );
                };

                let mut content = String::new();
                let mut thinking = String::new();
                let mut metrics = None;
                let outcome = {
                    let mut handler = |event: StreamEvent| {
                        match &event {
                            StreamEvent::Delta { text } => content.push_str(text),
                            StreamEvent::Thinking { text } => thinking.push_str(text),
                            StreamEvent::Metrics(m) => metrics = Some(m.clone()),
                            _ => {}
                        }
                        let mut guard = writer.lock().unwrap_or_else(|p| p.into_inner());
                        let emit: &mut (dyn FnMut(CompareEvent) + Send) = &mut **guard;
                        emit(CompareEvent {
                            index,
                            provider: target.provider.clone(),
                            model: target.model.clone(),
                            event,
                        });
                    };
                    adapter.chat(&request, cancel, &mut handler).await
                };

                let error = match outcome {
                    Ok(()) => None,
                    Err(err) => {
                        tracing::debug!(target = %target, error = %err, "compare target failed");
                        Some(err.to_string())
                    }
                };
                CompareResult {
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    content,
                    thinking,
                    metrics,
                    error,
                }
            }
        });

        join_all(runs).await
    }

    pub fn tools(&self) -> &Arc<McpManager> {
        &self.tools
    }

    pub async fn list_tools(&self) -> Vec<McpToolInfo> {
        self.tools.list_tools().await
    }

    pub async fn tool_status(&self) -> Vec<ServerStatus> {
        self.tools.status().await
    }

    /// Stop every tool server.
    pub async fn shutdown(&self) {
        self.tools.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::LoopEventKind;
    use crate::testing::{error_turn, text_turn, thinking_turn, PendingProvider, ScriptedProvider};
    use relay_provider::{Message, ProviderConfig, ProviderKind};
    use std::time::Duration;

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(McpManager::new(".")))
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_compare_target_parsing() {
        let target: CompareTarget = "ollama:llama3.2:3b".parse().unwrap();
        assert_eq!(target, CompareTarget::new("ollama", "llama3.2:3b"));
        assert_eq!(target.to_string(), "ollama:llama3.2:3b");
        assert!("ollama".parse::<CompareTarget>().is_err());
        assert!(":model".parse::<CompareTarget>().is_err());
    }

    #[tokio::test]
    async fn test_run_chat_removes_stream_on_return() {
        let mut gateway = gateway();
        gateway.register_provider(Arc::new(ScriptedProvider::named(
            "local",
            vec![text_turn(&["hey"])],
        )));

        let stream = gateway.open_stream();
        let id = stream.id().to_string();
        assert_eq!(gateway.active_streams(), 1);
        let mut events = Vec::new();
        let outcome = gateway
            .run_chat(stream, "local", request(), &mut |e| events.push(e))
            .await
            .unwrap();

        assert!(matches!(outcome, LoopOutcome::Completed(ref done) if done.message.content == "hey"));
        assert!(!gateway.cancel(&id));
        assert_eq!(gateway.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let gateway = gateway();
        let stream = gateway.open_stream();
        let err = gateway
            .run_chat(stream, "nope", request(), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownProvider(name) if name == "nope"));
        assert_eq!(gateway.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let mut gateway = gateway();
        gateway.register_provider(Arc::new(PendingProvider::new("slow")));

        let stream = gateway.open_stream();
        let id = stream.id().to_string();
        let mut events = Vec::new();
        let mut sink = |e: LoopEvent| events.push(e);
        let (outcome, cancelled) = tokio::join!(
            gateway.run_chat(stream, "slow", request(), &mut sink),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                gateway.cancel(&id)
            }
        );

        assert!(cancelled);
        assert!(matches!(outcome, Ok(LoopOutcome::Cancelled)));
        assert!(!events.is_empty());
        assert!(!events.iter().any(|e| matches!(
            e.kind,
            LoopEventKind::Stream(StreamEvent::Done) | LoopEventKind::Complete { .. }
        )));
        assert!(!gateway.streams.contains(&id));
    }

    #[tokio::test]
    async fn test_compare_fans_out_in_target_order() {
        let mut gateway = gateway();
        gateway.register_provider(Arc::new(ScriptedProvider::named(
            "a",
            vec![text_turn(&["alpha"])],
        )));
        gateway.register_provider(Arc::new(ScriptedProvider::named(
            "b",
            vec![thinking_turn("hmm", "beta", true)],
        )));
        gateway.register_provider(Arc::new(ScriptedProvider::named(
            "c",
            vec![error_turn("rate limited")],
        )));

        let targets = vec![
            CompareTarget::new("a", "m1"),
            CompareTarget::new("b", "m2"),
            CompareTarget::new("c", "m3"),
            CompareTarget::new("missing", "m4"),
        ];
        let mut events = Vec::new();
        let stream = gateway.open_stream();
        let results = gateway
            .compare(stream, &targets, request(), &mut |e| events.push(e))
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].content, "alpha");
        assert!(results[0].metrics.is_some());
        assert_eq!(results[1].content, "beta");
        assert_eq!(results[1].thinking, "hmm");
        assert!(results[2].error.as_deref().unwrap().contains("rate limited"));
        assert!(results[3].error.as_deref().unwrap().contains("missing"));
        assert!(events.iter().any(|e| e.index == 0 && e.event == StreamEvent::Done));
        assert!(events.iter().any(|e| e.index == 1 && e.model == "m2"));
        assert_eq!(gateway.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_from_config_skips_unusable_parts() {
        let mut config = Config::default();
        config.default_provider = "ollama".to_string();
        let mut openai = ProviderConfig::new(ProviderKind::OpenAi);
        openai.api_key = Some("sk-test".to_string());
        config.providers = vec![
            ProviderConfig::new(ProviderKind::Ollama),
            ProviderConfig::new(ProviderKind::LlamaCpp),
            openai,
        ];
        config.max_tool_iterations = 3;
        config.mcp_servers = vec![relay_mcp::McpServerConfig::new(
            "ghost",
            "/nonexistent/relay-test-server",
        )];

        let gateway = Gateway::from_config(&config).await.unwrap();
        assert_eq!(gateway.provider_names(), vec!["llamacpp", "ollama", "openai"]);
        assert_eq!(gateway.default_provider(), Some("ollama"));
        assert_eq!(gateway.loop_config.effective_cap(), 3);
        assert!(gateway.tool_status().await.is_empty());
        gateway.shutdown().await;
    }
}
