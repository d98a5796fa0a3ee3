// LLM Module - Chat-completion providers for generation, rewrite, and judging
// Providers are a tagged union resolved through a registry table; adding one
// means adding a variant and a registry row, nothing else dispatches on model
// name strings. All HTTP providers speak the OpenAI-compatible wire format.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Settings;
use crate::errors::RagError;
use crate::models::TokenUsage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Chat model seam. Production uses [`HttpChatModel`]; tests script it.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Await the full answer.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatCompletion>;

    /// Stream token chunks into `tx`, returning final usage. A dropped
    /// receiver cancels generation; the usage accumulated so far is still
    /// returned so the caller can persist the partial turn.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<TokenUsage>;

    fn model_name(&self) -> &str;
}

/// Known chat providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatProvider {
    Qwen,
    DeepSeek,
    OpenAICompatible,
}

/// Registry row: model-name prefix plus everything needed to reach the
/// provider.
struct ProviderProfile {
    prefix: &'static str,
    provider: ChatProvider,
    /// Raw JSON merged into streaming requests (some providers need an
    /// explicit opt-in to receive usage on the final chunk).
    extra_stream_options: Option<&'static str>,
}

const PROVIDER_REGISTRY: &[ProviderProfile] = &[
    ProviderProfile {
        prefix: "qwen",
        provider: ChatProvider::Qwen,
        extra_stream_options: None,
    },
    ProviderProfile {
        prefix: "deepseek",
        provider: ChatProvider::DeepSeek,
        extra_stream_options: None,
    },
];

impl ChatProvider {
    /// Resolve a provider from a model name via the registry; unknown
    /// prefixes fall back to the generic OpenAI-compatible endpoint.
    pub fn for_model(model: &str) -> ChatProvider {
        PROVIDER_REGISTRY
            .iter()
            .find(|p| model.starts_with(p.prefix))
            .map(|p| p.provider)
            .unwrap_or(ChatProvider::OpenAICompatible)
    }

    fn credentials(&self, settings: &Settings) -> Result<(String, String)> {
        let (key, base) = match self {
            ChatProvider::Qwen => (
                settings.dashscope_api_key.clone(),
                settings.dashscope_base_url.clone(),
            ),
            ChatProvider::DeepSeek => (
                settings.deepseek_api_key.clone(),
                settings.deepseek_base_url.clone(),
            ),
            ChatProvider::OpenAICompatible => (
                settings.openai_api_key.clone(),
                settings.openai_base_url.clone(),
            ),
        };
        let key = key.ok_or_else(|| anyhow!("No API key configured for provider {self:?}"))?;
        Ok((key, base.trim_end_matches('/').to_string()))
    }

    fn stream_options(&self, model: &str) -> serde_json::Value {
        let extra = PROVIDER_REGISTRY
            .iter()
            .find(|p| model.starts_with(p.prefix))
            .and_then(|p| p.extra_stream_options)
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());
        let mut options = serde_json::json!({ "include_usage": true });
        if let Some(serde_json::Value::Object(map)) = extra {
            for (k, v) in map {
                options[k] = v;
            }
        }
        options
    }
}

// Wire types for the OpenAI-compatible chat endpoint.

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Rough token estimate used when a provider omits usage (for example after
/// a cancelled stream): one token per four characters.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(if text.is_empty() { 0 } else { 1 })
}

pub struct HttpChatModel {
    client: reqwest::Client,
    model: String,
    api_key: String,
    api_base: String,
    stream_options: serde_json::Value,
}

impl HttpChatModel {
    pub fn from_settings(model: &str, settings: &Settings) -> Result<Self> {
        let provider = ChatProvider::for_model(model);
        let (api_key, api_base) = provider.credentials(settings)?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            model: model.to_string(),
            api_key,
            api_base,
            stream_options: provider.stream_options(model),
        })
    }

    async fn post(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .context("LLM request failed")?;

        if response.status().as_u16() == 429 {
            return Err(RagError::LlmRateLimited(self.model.clone()).into());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::LlmFailed(format!("{status}: {body}")).into());
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatCompletion> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: None,
            stream_options: None,
        };

        let response: ChatResponse = self.post(&request).await?.json().await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::LlmFailed("empty completion".to_string()))?;

        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_else(|| TokenUsage {
                input_tokens: messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
                output_tokens: estimate_tokens(&content),
            });

        Ok(ChatCompletion { content, usage })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<TokenUsage> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: Some(true),
            stream_options: Some(self.stream_options.clone()),
        };

        let response = self.post(&request).await?;
        let mut body = response.bytes_stream();

        let mut buffer = String::new();
        let mut emitted = String::new();
        let mut usage: Option<TokenUsage> = None;

        'outer: while let Some(chunk) = body.next().await {
            let chunk = chunk.context("LLM stream read failed")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited `data:` lines.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() {
                    continue;
                }
                if payload == "[DONE]" {
                    break 'outer;
                }

                let parsed: StreamChunk = match serde_json::from_str(payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "Skipping unparseable stream chunk");
                        continue;
                    }
                };

                if let Some(u) = parsed.usage {
                    usage = Some(TokenUsage {
                        input_tokens: u.prompt_tokens,
                        output_tokens: u.completion_tokens,
                    });
                }

                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content {
                        if content.is_empty() {
                            continue;
                        }
                        emitted.push_str(&content);
                        if tx.send(content).await.is_err() {
                            // Receiver gone: the request was cancelled.
                            debug!("Stream receiver dropped, stopping generation");
                            break 'outer;
                        }
                    }
                }
            }
        }

        Ok(usage.unwrap_or_else(|| TokenUsage {
            input_tokens: messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
            output_tokens: estimate_tokens(&emitted),
        }))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted chat model for tests and embedded development: replays canned
/// responses in order, falling back to the last one.
pub struct ScriptedChatModel {
    responses: std::sync::Mutex<Vec<String>>,
    fallback: String,
}

impl ScriptedChatModel {
    pub fn new(responses: Vec<String>) -> Self {
        let fallback = responses
            .last()
            .cloned()
            .unwrap_or_else(|| "scripted response".to_string());
        Self {
            responses: std::sync::Mutex::new(responses),
            fallback,
        }
    }

    pub fn always(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    fn next_response(&self) -> String {
        let mut responses = self.responses.lock().expect("scripted responses lock");
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses.first().cloned().unwrap_or_else(|| self.fallback.clone())
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatCompletion> {
        let content = self.next_response();
        Ok(ChatCompletion {
            usage: TokenUsage {
                input_tokens: messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
                output_tokens: estimate_tokens(&content),
            },
            content,
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::Sender<String>,
    ) -> Result<TokenUsage> {
        let content = self.next_response();
        let mut emitted = String::new();
        for word in content.split_inclusive(' ') {
            emitted.push_str(word);
            if tx.send(word.to_string()).await.is_err() {
                break;
            }
        }
        Ok(TokenUsage {
            input_tokens: messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
            output_tokens: estimate_tokens(&emitted),
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
