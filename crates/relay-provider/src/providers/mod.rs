//! Protocol adapters, one per backend family.

pub mod anthropic;
pub mod llamacpp;
pub mod ollama;
pub mod openai;
mod openai_compat;

use crate::error::ProviderError;
use crate::traits::Provider;
use crate::types::{Attachment, ChatRequest, Message, ModelInfo, StreamEvent};
use anthropic::AnthropicProvider;
use async_trait::async_trait;
use llamacpp::LlamaCppProvider;
use ollama::OllamaProvider;
use openai::OpenAiProvider;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default transport timeout for one provider request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// The fixed set of wire-protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    #[serde(rename = "llamacpp")]
    LlamaCpp,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::LlamaCpp => "llamacpp",
        }
    }

    /// Whether the backend runs on the user's machine.
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderKind::Ollama | ProviderKind::LlamaCpp)
    }

    /// Environment variable holding the API key, for cloud backends.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Ollama | ProviderKind::LlamaCpp => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            "llamacpp" | "llama.cpp" | "llama-cpp" => Ok(ProviderKind::LlamaCpp),
            other => Err(ProviderError::InvalidModel(format!(
                "unknown provider kind '{other}'"
            ))),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

/// Serialized settings for one configured backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry name; defaults to the kind's name.
    #[serde(default)]
    pub name: Option<String>,
    /// Wire-protocol family.
    pub kind: ProviderKind,
    /// Override the default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key. Cloud backends fall back to their environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Transport timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// llama.cpp only: the server has a multimodal projector loaded.
    #[serde(default)]
    pub vision: bool,
    /// Replaces the built-in model catalog when non-empty.
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

impl ProviderConfig {
    /// Minimal config for `kind` with defaults everywhere else.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            name: None,
            kind,
            base_url: None,
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            vision: false,
            models: Vec::new(),
        }
    }

    /// Registry name for this provider.
    pub fn registry_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }

    fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| {
                self.kind
                    .api_key_env()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|key| !key.is_empty())
            })
    }
}

/// The closed set of adapters behind one interface.
pub enum AnyProvider {
    Anthropic(AnthropicProvider),
    OpenAi(OpenAiProvider),
    Ollama(OllamaProvider),
    LlamaCpp(LlamaCppProvider),
}

impl AnyProvider {
    /// Build the adapter described by `config`.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = http_client(timeout)?;
        let name = config.registry_name();

        let provider = match config.kind {
            ProviderKind::Anthropic => {
                let key = config.resolve_api_key().ok_or_else(|| {
                    ProviderError::Auth("ANTHROPIC_API_KEY is not set".to_string())
                })?;
                let mut p = AnthropicProvider::new(key).with_client(client).with_name(name);
                if let Some(url) = &config.base_url {
                    p = p.with_base_url(url.clone());
                }
                if !config.models.is_empty() {
                    p = p.with_models(config.models.clone());
                }
                AnyProvider::Anthropic(p)
            }
            ProviderKind::OpenAi => {
                let key = config.resolve_api_key().ok_or_else(|| {
                    ProviderError::Auth("OPENAI_API_KEY is not set".to_string())
                })?;
                let mut p = OpenAiProvider::new(key).with_client(client).with_name(name);
                if let Some(url) = &config.base_url {
                    p = p.with_base_url(url.clone());
                }
                if !config.models.is_empty() {
                    p = p.with_models(config.models.clone());
                }
                AnyProvider::OpenAi(p)
            }
            ProviderKind::Ollama => {
                let mut p = OllamaProvider::new().with_client(client).with_name(name);
                if let Some(url) = &config.base_url {
                    p = p.with_base_url(url.clone());
                }
                if !config.models.is_empty() {
                    p = p.with_models(config.models.clone());
                }
                AnyProvider::Ollama(p)
            }
            ProviderKind::LlamaCpp => {
                let mut p = LlamaCppProvider::new()
                    .with_client(client)
                    .with_name(name)
                    .with_vision(config.vision);
                if let Some(url) = &config.base_url {
                    p = p.with_base_url(url.clone());
                }
                if let Some(key) = config.resolve_api_key() {
                    p = p.with_api_key(key);
                }
                if !config.models.is_empty() {
                    p = p.with_models(config.models.clone());
                }
                AnyProvider::LlamaCpp(p)
            }
        };
        Ok(provider)
    }

    fn inner(&self) -> &dyn Provider {
        match self {
            AnyProvider::Anthropic(p) => p,
            AnyProvider::OpenAi(p) => p,
            AnyProvider::Ollama(p) => p,
            AnyProvider::LlamaCpp(p) => p,
        }
    }
}

#[async_trait]
impl Provider for AnyProvider {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.inner().models()
    }

    fn supports_vision(&self, model: &str) -> bool {
        self.inner().supports_vision(model)
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn FnMut(StreamEvent) + Send),
    ) -> Result<(), ProviderError> {
        self.inner().chat(request, cancel, sink).await
    }
}

/// HTTP client with the configured transport timeout.
pub fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Ok(Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Image attachments of `message` that `model` may receive.
///
/// Everything else is dropped silently.
pub(crate) fn usable_images<'a>(
    message: &'a Message,
    vision: bool,
    model: &str,
) -> Vec<&'a Attachment> {
    let (images, dropped): (Vec<&Attachment>, Vec<&Attachment>) = message
        .attachments
        .iter()
        .partition(|attachment| vision && attachment.is_image());
    if !dropped.is_empty() {
        tracing::debug!(
            model,
            dropped = dropped.len(),
            "dropping attachments the model cannot accept"
        );
    }
    images
}

fn model(id: &str, name: &str, context_window: usize, max_output_tokens: usize) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
        context_window,
        max_output_tokens,
        supports_thinking: false,
        supports_tools: true,
        supports_vision: false,
    }
}
