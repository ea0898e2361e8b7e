use std::time::Duration;

use anyhow::Context;
use axum::http::StatusCode;
use tracing::{debug, info};

use crate::{
    chat::dto::{
        ChatMessage, CompletionRequest, CompletionResponse, ModelList, Role,
    },
    config::ChatConfig,
};

const MAX_TOKENS: u32 = 1000;
const TEMPERATURE: f32 = 0.7;
const APP_TITLE: &str = "Chat AI App";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("completion API key not configured")]
    NotConfigured,
    #[error("completion API rejected the key")]
    InvalidKey,
    #[error("completion API rate limit hit")]
    RateLimited,
    #[error("completion API rejected the request")]
    BadRequest,
    #[error("completion API timed out")]
    Timeout,
    #[error("completion API returned no content")]
    EmptyResponse,
    #[error("completion API failure: {0}")]
    Upstream(String),
}

impl ChatError {
    fn from_upstream_status(status: u16) -> Self {
        match status {
            401 => ChatError::InvalidKey,
            429 => ChatError::RateLimited,
            400 => ChatError::BadRequest,
            other => ChatError::Upstream(format!("status {other}")),
        }
    }

    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChatError::Timeout
        } else {
            ChatError::Upstream(e.to_string())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::NotConfigured | ChatError::InvalidKey | ChatError::EmptyResponse => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ChatError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ChatError::BadRequest => StatusCode::BAD_REQUEST,
            ChatError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ChatError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn client_message(&self) -> &'static str {
        match self {
            ChatError::NotConfigured => "Completion API key not configured",
            ChatError::InvalidKey => "Invalid completion API key",
            ChatError::RateLimited => "Rate limit exceeded. Please try again later.",
            ChatError::BadRequest => "Invalid request to AI service",
            ChatError::Timeout => "Request timeout. Please try again.",
            ChatError::EmptyResponse => "No response received from AI",
            ChatError::Upstream(_) => "Error communicating with AI service",
        }
    }
}

/// Answer extracted from a completion.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub usage: Option<serde_json::Value>,
}

/// Thin client for an OpenAI-compatible completion API.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    referer: String,
}

impl ChatClient {
    pub fn new(cfg: &ChatConfig, referer: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed building chat HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            referer: referer.to_string(),
        })
    }

    pub fn build_request(&self, history: &[ChatMessage], message: &str) -> CompletionRequest {
        let mut messages = history.to_vec();
        messages.push(ChatMessage {
            role: Role::User,
            content: message.trim().to_string(),
        });
        CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }

    fn api_key(&self) -> Result<&str, ChatError> {
        self.api_key.as_deref().ok_or(ChatError::NotConfigured)
    }

    pub async fn complete(
        &self,
        history: &[ChatMessage],
        message: &str,
    ) -> Result<ChatReply, ChatError> {
        let key = self.api_key()?;
        let payload = self.build_request(history, message);
        debug!(model = %payload.model, turns = payload.messages.len(), "sending completion request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", APP_TITLE)
            .json(&payload)
            .send()
            .await
            .map_err(ChatError::from_transport)?;

        if !response.status().is_success() {
            return Err(ChatError::from_upstream_status(response.status().as_u16()));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(ChatError::from_transport)?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or(ChatError::EmptyResponse)?;

        info!(
            chars = content.len(),
            total_tokens = ?body.usage.as_ref().and_then(|u| u.get("total_tokens")),
            "completion received"
        );

        Ok(ChatReply {
            content,
            usage: body.usage,
        })
    }

    pub async fn list_models(&self) -> Result<Vec<serde_json::Value>, ChatError> {
        let key = self.api_key()?;
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(key)
            .send()
            .await
            .map_err(ChatError::from_transport)?;

        if !response.status().is_success() {
            return Err(ChatError::from_upstream_status(response.status().as_u16()));
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(ChatError::from_transport)?;
        Ok(list.data)
    }
}
