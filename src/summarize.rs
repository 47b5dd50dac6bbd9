//! Text-completion client used to rewrite cleaned container logs for humans.

use crate::config::SummarizerConfig;
use crate::env::EnvSnapshot;
use crate::error::SolverError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer is disabled in config")]
    Disabled,
    #[error("summarizer API key is missing: {0} is not set")]
    MissingApiKey(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("summarizer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("summarizer response contained no text")]
    EmptyResponse,
}

pub trait Summarizer {
    /// Sends one non-streaming completion request and returns the reply text.
    fn summarize(&self, system_prompt: &str, user_prompt: &str) -> Result<String, SummarizeError>;
}

impl<T: Summarizer + ?Sized> Summarizer for Box<T> {
    fn summarize(&self, system_prompt: &str, user_prompt: &str) -> Result<String, SummarizeError> {
        (**self).summarize(system_prompt, user_prompt)
    }
}

/// Stand-in used when `summarizer.enabled` is false; every call fails so the
/// sanitizer falls back to the cleaned logs.
pub struct DisabledSummarizer;

impl Summarizer for DisabledSummarizer {
    fn summarize(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, SummarizeError> {
        Err(SummarizeError::Disabled)
    }
}

/// OpenAI-compatible `/chat/completions` client. One request, no retries.
pub struct ChatCompletionsSummarizer {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key_env: String,
    api_key: Option<String>,
}

impl ChatCompletionsSummarizer {
    pub fn from_config(cfg: &SummarizerConfig, env: &EnvSnapshot) -> Result<Self, SolverError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_sec))
            .user_agent("aider-solver")
            .build()
            .map_err(|err| SolverError::Config(format!("failed to build http client: {err}")))?;
        let api_key = env
            .get(&cfg.api_key_env)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key_env: cfg.api_key_env.clone(),
            api_key,
        })
    }

    fn build_request(&self, system_prompt: &str, user_prompt: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatCompletionMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatCompletionMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            stream: false,
        }
    }
}

impl Summarizer for ChatCompletionsSummarizer {
    fn summarize(&self, system_prompt: &str, user_prompt: &str) -> Result<String, SummarizeError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SummarizeError::MissingApiKey(self.api_key_env.clone()))?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.build_request(system_prompt, user_prompt))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SummarizeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: ChatCompletionResponse = response.json()?;
        first_choice_text(payload)
    }
}

fn first_choice_text(payload: ChatCompletionResponse) -> Result<String, SummarizeError> {
    payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or(SummarizeError::EmptyResponse)
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}
