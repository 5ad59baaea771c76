//! Generator boundary
//!
//! The text generator is an external collaborator: a rendered prompt goes in,
//! raw text comes out. `OpenAiGenerator` talks to any OpenAI-compatible chat
//! completions endpoint; `ScriptedGenerator` replays canned responses.

use crate::config::GeneratorConfig;
use crate::error::redact_credentials;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("generator not configured: {0}")]
    NotConfigured(String),

    #[error("generator request failed: {0}")]
    Transport(String),

    #[error("generator timed out after {0:?}")]
    Timeout(Duration),

    #[error("generator API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("generator refused the request: {0}")]
    Refused(String),

    #[error("generator returned an empty response")]
    Empty,

    #[error("no scripted response left for stage '{stage}'")]
    Unscripted { stage: String },
}

/// One generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Stage asking, for logging and scripted replies
    pub stage: String,
    pub prompt: String,
    pub max_output_tokens: u32,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<String, GeneratorError>;
}

const SYSTEM_PROMPT: &str = "You are a careful business intelligence assistant. \
Follow the requested output format exactly and add nothing else.";

pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| GeneratorError::NotConfigured("OPENAI_API_KEY is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            timeout: config.timeout,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> GeneratorError {
        if err.is_timeout() {
            GeneratorError::Timeout(self.timeout)
        } else {
            GeneratorError::Transport(redact_credentials(&err.to_string()))
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String, GeneratorError> {
        debug!(stage = %request.stage, model = %self.model, prompt = %request.prompt, "Calling generator");

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": request.prompt}
            ],
            "temperature": 0.1,
            "max_tokens": request.max_output_tokens
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message: String = text.chars().take(500).collect();
            return Err(GeneratorError::Api {
                status: status.as_u16(),
                message: redact_credentials(&message),
            });
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| self.transport_error(e))?;
        extract_content(&response_json, &request.stage)
    }
}

fn extract_content(response_json: &serde_json::Value, stage: &str) -> Result<String, GeneratorError> {
    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .ok_or(GeneratorError::Empty)?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("content_filter") => {
            return Err(GeneratorError::Refused("response blocked by content filter".to_string()))
        }
        Some("length") => warn!(stage = %stage, "Generator response hit the token limit and may be cut off"),
        _ => {}
    }

    let content = choice["message"]["content"].as_str().unwrap_or("").trim();
    if content.is_empty() {
        return Err(GeneratorError::Empty);
    }
    Ok(content.to_string())
}

/// Deterministic generator for tests and offline runs: per-stage queues of
/// canned replies, consumed in order. Every prompt is recorded.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<HashMap<String, VecDeque<Result<String, GeneratorError>>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `stage`
    pub fn respond(self, stage: &str, text: impl Into<String>) -> Self {
        self.push(stage, Ok(text.into()));
        self
    }

    /// Queue a failure for `stage`
    pub fn fail(self, stage: &str, error: GeneratorError) -> Self {
        self.push(stage, Err(error));
        self
    }

    pub fn push(&self, stage: &str, reply: Result<String, GeneratorError>) {
        let mut replies = self.replies.lock().unwrap_or_else(|p| p.into_inner());
        replies.entry(stage.to_string()).or_default().push_back(reply);
    }

    /// `(stage, prompt)` pairs in call order
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls(&self, stage: &str) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(s, _)| s == stage)
            .count()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String, GeneratorError> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((request.stage.clone(), request.prompt.clone()));

        let mut replies = self.replies.lock().unwrap_or_else(|p| p.into_inner());
        replies
            .get_mut(&request.stage)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(GeneratorError::Unscripted { stage: request.stage }))
    }
}
