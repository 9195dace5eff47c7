use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub base_url: String,
    /// Name of the environment variable (or secrets key) holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: 0.0,
            max_tokens: 1000,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Text-in, text-out access to a language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Completes `prompt`, cutting generation at the first of `stop`.
    async fn complete(&self, prompt: &str, stop: &[&str]) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct LLM {
    client: Client,
    config: LLMConfig,
    api_key: String,
}

impl LLM {
    pub fn new(config: LLMConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(LLM {
            client,
            config,
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatModel for LLM {
    async fn complete(&self, prompt: &str, stop: &[&str]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stop: stop.to_vec(),
        };

        debug!(model = %self.config.model, prompt_chars = prompt.len(), "sending completion request");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let err = status_error(status, &body);
            warn!(status = status.as_u16(), "completion request failed: {err}");
            return Err(err);
        }

        parse_completion(&body)
    }
}

fn status_error(status: StatusCode, body: &str) -> AssistantError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.canonical_reason().unwrap_or("unknown error").to_string()
            } else {
                trimmed.to_string()
            }
        });

    if status == StatusCode::TOO_MANY_REQUESTS {
        AssistantError::RateLimited(message)
    } else {
        AssistantError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

fn parse_completion(body: &str) -> Result<String> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)?;
    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| AssistantError::Api {
            status: 200,
            message: "response contained no choices".to_string(),
        })
}
