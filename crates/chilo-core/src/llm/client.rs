//! Request/response client against a chat-completion style endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LlmEndpoint;
use crate::error::LlmError;

/// Shared across every [`LlmClient`] instance in the process, matching
/// `LLMTool._global_request_count` in the system this was modeled on.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn global_request_count() -> u64 {
    REQUEST_COUNTER.load(Ordering::SeqCst)
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct LlmClient {
    http: reqwest::blocking::Client,
    endpoint: Arc<LlmEndpoint>,
    max_backoff: Duration,
}

impl LlmClient {
    pub fn new(endpoint: LlmEndpoint) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            endpoint: Arc::new(endpoint),
            max_backoff: Duration::from_secs(8),
        }
    }

    /// Retries indefinitely on transport error with short exponential
    /// backoff, capped to avoid a hot retry loop.
    pub fn chat(&self, request: &LlmRequest) -> LlmResponse {
        let mut backoff = Duration::from_millis(200);
        loop {
            let id = REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(request_id = id, "sending LLM request");
            match self.try_chat(request) {
                Ok(response) => return response,
                Err(err) => {
                    tracing::warn!(request_id = id, error = %err, "LLM transport error, retrying");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }

    fn try_chat(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequestBody {
            model: &self.endpoint.model,
            messages,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.endpoint.base_url))
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
            .send()
            .map_err(LlmError::Transport)?
            .error_for_status()
            .map_err(LlmError::Transport)?;

        let parsed: ChatResponseBody = response.json().map_err(LlmError::Transport)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default();
        Ok(LlmResponse {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_counter_is_process_wide_and_monotonic() {
        let before = global_request_count();
        REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        assert!(global_request_count() > before);
    }
}
