//! OpenRouter LLM client
//!
//! Async HTTP client for the OpenRouter chat completions API. Every call
//! accepts a cancellation token; a cancelled call returns [`Error::Cancelled`]
//! without waiting for the HTTP response.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::types::{ApiError, ChatRequest, ChatResponse, Message};

/// OpenRouter API base URL
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// System prompt for merging two entity descriptions
const MERGE_SYSTEM_PROMPT: &str = "\
You are a knowledge graph entity merger. Your task is to merge two entity descriptions into a single, coherent entity that preserves ALL information, references, and relationships from both inputs.

CRITICAL REQUIREMENTS:
1. Preserve ALL wiki-links in [[entity-id]] format from both entities
2. Preserve ALL factual information from both entities
3. Preserve ALL sources listed from both entities
4. Preserve ALL relationships and connections mentioned
5. Remove only truly redundant information (exact duplicates)
6. Organize the merged content coherently with appropriate sections
7. Do NOT add any new information not present in either source
8. Do NOT remove any unique information from either source
9. Maintain a neutral, encyclopedic tone

Output the merged content in markdown format without frontmatter (that will be handled separately).";

/// A language model capable of text completions.
///
/// Abstracted behind a trait so graph operations can be tested with a
/// deterministic stub.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a bare user prompt
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;

    /// Complete a user prompt under a system prompt
    async fn complete_with_system(
        &self,
        system: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Merge two entity content bodies into one, preserving wiki-links and
    /// facts from both
    async fn merge_two(
        &self,
        first: &str,
        second: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let user = format!(
            "Please merge these two entity descriptions:\n\n\
             === ENTITY 1 ===\n{first}\n\n\
             === ENTITY 2 ===\n{second}\n\n\
             Output only the merged content."
        );
        self.complete_with_system(MERGE_SYSTEM_PROMPT, &user, cancel)
            .await
    }
}

/// OpenRouter-backed [`LanguageModel`]
#[derive(Clone)]
pub struct OpenRouterClient {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("base_url", &self.base_url)
            .field("default_model", &self.config.default_model)
            .finish()
    }
}

/// Builder for creating an OpenRouterClient
pub struct OpenRouterClientBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl Default for OpenRouterClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenRouterClientBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            api_key: None,
            base_url: None,
        }
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the base URL (defaults to OpenRouter; tests point this at a
    /// local server)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn build(self) -> Result<OpenRouterClient> {
        let config = self.config.unwrap_or_else(|| crate::config::Config::default().llm);
        let api_key = self.api_key.ok_or_else(|| {
            Error::Llm("no API key provided".to_string())
        })?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(OpenRouterClient {
            http_client,
            config,
            api_key,
            base_url: self
                .base_url
                .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string()),
        })
    }
}

impl OpenRouterClient {
    pub fn builder() -> OpenRouterClientBuilder {
        OpenRouterClientBuilder::new()
    }

    async fn chat(
        &self,
        model: &str,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages,
        };
        debug!(model, "sending chat completion request");

        let send = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send();

        // Biased so an already-cancelled token wins over an in-flight request.
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.text() => body?,
        };

        if !status.is_success() {
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(Error::Llm(format!(
                    "API error ({status}): {}",
                    api_error.error.message
                )));
            }
            return Err(Error::Llm(format!("API error ({status})")));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("unexpected response shape: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Llm("no completion choices returned".to_string()))?;

        Ok(choice.message.content)
    }
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        self.chat(
            &self.config.default_model,
            vec![Message::user(prompt)],
            cancel,
        )
        .await
    }

    async fn complete_with_system(
        &self,
        system: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.chat(
            &self.config.default_model,
            vec![Message::system(system), Message::user(user)],
            cancel,
        )
        .await
    }

    async fn merge_two(
        &self,
        first: &str,
        second: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Merging uses the dedicated merge model; the default trait body
        // would route through the default model.
        let user = format!(
            "Please merge these two entity descriptions:\n\n\
             === ENTITY 1 ===\n{first}\n\n\
             === ENTITY 2 ===\n{second}\n\n\
             Output only the merged content."
        );
        self.chat(
            &self.config.merge_model,
            vec![Message::system(MERGE_SYSTEM_PROMPT), Message::user(&user)],
            cancel,
        )
        .await
    }
}
